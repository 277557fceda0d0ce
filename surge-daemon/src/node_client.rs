use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tokio_util::io::StreamReader;
use tracing::error;

use surge_api_core::SamplingParams;

#[derive(Debug)]
pub enum NodeRpcError {
    /// The node endpoint could not be reached or timed out.
    Unavailable(String),
    /// The node answered but refused or broke the protocol.
    Protocol(String),
    /// The node reported that it could not load the model.
    LoadFailed(String),
}

impl fmt::Display for NodeRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRpcError::Unavailable(e) => write!(f, "node unavailable: {e}"),
            NodeRpcError::Protocol(e) => write!(f, "node protocol error: {e}"),
            NodeRpcError::LoadFailed(e) => write!(f, "model load failed: {e}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadModelRequest {
    pub session_id: String,
    /// Preloaded model id or HuggingFace repo coordinate
    pub model_id: String,
    pub is_hf_download: bool,
    pub context_length: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelLoadStatus {
    Downloading { message: String },
    Loading,
    Ready,
    Failed { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerateRequest {
    pub session_id: String,
    pub message: String,
    pub params: SamplingParams,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenFrame {
    pub token: String,
    pub is_final: bool,
}

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<TokenFrame, NodeRpcError>> + Send>>;

/// RPC surface of the node-side runtime wrapper. Generation is a
/// streaming call delivering newline-delimited token frames.
#[async_trait]
pub trait NodeRpc: Send + Sync {
    async fn load_model(
        &self,
        endpoint: &str,
        request: &LoadModelRequest,
    ) -> Result<(), NodeRpcError>;

    async fn model_status(
        &self,
        endpoint: &str,
        session_id: &str,
    ) -> Result<ModelLoadStatus, NodeRpcError>;

    async fn generate(
        &self,
        endpoint: &str,
        request: &GenerateRequest,
    ) -> Result<TokenStream, NodeRpcError>;

    async fn stop_model(&self, endpoint: &str, session_id: &str) -> Result<(), NodeRpcError>;
}

#[derive(Deserialize)]
struct ModelStatusResponse {
    status: String,
    #[serde(default)]
    message: String,
}

pub struct HttpNodeClient {
    client: reqwest::Client,
    rpc_timeout: Duration,
}

impl HttpNodeClient {
    pub fn new(rpc_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to build http client");

        Self {
            client,
            rpc_timeout,
        }
    }
}

#[async_trait]
impl NodeRpc for HttpNodeClient {
    async fn load_model(
        &self,
        endpoint: &str,
        request: &LoadModelRequest,
    ) -> Result<(), NodeRpcError> {
        let response = self
            .client
            .post(format!("{endpoint}/load_model"))
            .timeout(self.rpc_timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| NodeRpcError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();

            return Err(NodeRpcError::LoadFailed(body));
        }

        Ok(())
    }

    async fn model_status(
        &self,
        endpoint: &str,
        session_id: &str,
    ) -> Result<ModelLoadStatus, NodeRpcError> {
        let response = self
            .client
            .get(format!("{endpoint}/model_status/{session_id}"))
            .timeout(self.rpc_timeout)
            .send()
            .await
            .map_err(|e| NodeRpcError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NodeRpcError::Protocol(format!(
                "status query returned {}",
                response.status()
            )));
        }

        let status: ModelStatusResponse = response
            .json()
            .await
            .map_err(|e| NodeRpcError::Protocol(e.to_string()))?;

        let status = match status.status.as_str() {
            "downloading" => ModelLoadStatus::Downloading {
                message: status.message,
            },
            "loading" => ModelLoadStatus::Loading,
            "ready" => ModelLoadStatus::Ready,
            "failed" => ModelLoadStatus::Failed {
                message: status.message,
            },
            other => {
                return Err(NodeRpcError::Protocol(format!(
                    "unknown model status: {other}"
                )));
            }
        };

        Ok(status)
    }

    async fn generate(
        &self,
        endpoint: &str,
        request: &GenerateRequest,
    ) -> Result<TokenStream, NodeRpcError> {
        let response = self
            .client
            .post(format!("{endpoint}/generate"))
            .json(request)
            .send()
            .await
            .inspect_err(|error| error!(?error, "node generate request error"))
            .map_err(|e| NodeRpcError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NodeRpcError::Protocol(format!(
                "generate returned {}",
                response.status()
            )));
        }

        let reader = StreamReader::new(response.bytes_stream().map_err(std::io::Error::other));

        let frames =
            LinesStream::new(BufReader::new(reader).lines()).filter_map(|line| async move {
            match line {
                Ok(line) if line.trim().is_empty() => None,
                Ok(line) => Some(
                    serde_json::from_str::<TokenFrame>(line.trim())
                        .map_err(|e| NodeRpcError::Protocol(e.to_string())),
                ),
                Err(e) => Some(Err(NodeRpcError::Unavailable(e.to_string()))),
            }
        });

        Ok(Box::pin(frames))
    }

    async fn stop_model(&self, endpoint: &str, session_id: &str) -> Result<(), NodeRpcError> {
        self.client
            .post(format!("{endpoint}/stop_model/{session_id}"))
            .timeout(self.rpc_timeout)
            .send()
            .await
            .map_err(|e| NodeRpcError::Unavailable(e.to_string()))?
            .error_for_status()
            .map_err(|e| NodeRpcError::Protocol(e.to_string()))?;

        Ok(())
    }
}
