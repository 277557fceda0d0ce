use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Unique account name
    pub name: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub user_id: String,
    /// Bearer token for authenticated requests
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub name: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub user_id: String,
    /// Fresh bearer token, invalidates the previous one
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeResponse {
    pub user_id: String,
    pub name: String,
    pub is_admin: bool,
    /// Prepaid wallet balance in satoshis
    pub balance_sats: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub name: String,
    pub vram_mb: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareInfo {
    pub cpu: String,
    pub ram_mb: i64,
    pub disk_gb: i64,
    pub gpus: Vec<GpuInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model identifier as reported by the node runtime
    pub id: String,
    pub name: String,
    pub architecture: String,
    pub parameter_count_m: i64,
    pub quantization: String,
    pub context_length: i64,
    pub min_vram_mb: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterNodeRequest {
    pub name: String,
    /// HTTP endpoint the coordinator dispatches load/chat/stop RPCs to
    pub endpoint_url: String,
    pub price_per_minute_sats: i64,
    pub hardware: HardwareInfo,
    pub models: Vec<ModelInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterNodeResponse {
    pub node_id: String,
    /// One-time fee debited from the owner's wallet
    pub registration_fee_sats: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node_id: String,
    /// Current load factor in [0, 1] as reported by the runtime
    pub load: f64,
    pub hardware: HardwareInfo,
    pub models: Vec<ModelInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailableModelsResponse {
    /// Models loadable right now on at least one idle node
    pub models: Vec<ModelInfo>,
    /// Models only present on currently occupied nodes
    pub busy_models: Vec<ModelInfo>,
    pub total_nodes_online: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeListing {
    pub node_id: String,
    pub name: String,
    pub hardware: HardwareInfo,
    pub price_per_minute_sats: i64,
    /// "online" or "busy"
    pub status: String,
    pub models: Vec<ModelInfo>,
    /// Unix millis until which the node is occupied, if busy
    pub busy_until: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnlineNodesResponse {
    pub nodes: Vec<NodeListing>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSessionRequest {
    pub node_id: String,
    /// Id of a model preloaded on the node, ignored when hf_repo is set
    pub model: Option<String>,
    /// HuggingFace coordinate `owner/name[:quant]` for dynamic download
    pub hf_repo: Option<String>,
    pub minutes: u32,
    pub context_length: u32,
    /// "lightning" or "wallet"
    pub payment_method: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSessionResponse {
    pub session_id: String,
    /// BOLT-11 payment request, present for lightning sessions
    pub invoice: Option<String>,
    pub amount_sats: i64,
    /// Unix millis at which the unpaid session lapses
    pub expires_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckPaymentResponse {
    pub paid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositRequest {
    pub amount_sats: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositResponse {
    pub invoice: String,
    pub payment_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositCheckResponse {
    /// "pending", "paid" or "expired"
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaySessionRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaySessionResponse {
    pub amount_paid_sats: i64,
    pub new_balance_sats: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawRequest {
    /// BOLT-11 payment request to pay out to
    pub bolt11: String,
    pub amount_sats: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawResponse {
    pub fee_paid_sats: i64,
    pub new_balance_sats: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub id: String,
    /// "deposit", "session_payment", "node_earning", "commission",
    /// "withdrawal" or "refund"
    pub tx_type: String,
    /// Signed amount in satoshis, negative for outgoing
    pub amount_sats: i64,
    pub fee_sats: i64,
    pub description: String,
    pub related_session_id: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionsResponse {
    pub transactions: Vec<TransactionInfo>,
    pub page: u32,
    pub page_size: u32,
}

/// Sampling parameters forwarded verbatim to the node runtime with each
/// chat message. Defaults mirror the llama.cpp server defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_k")]
    pub top_k: i32,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default)]
    pub min_p: f64,
    #[serde(default = "default_typical_p")]
    pub typical_p: f64,
    #[serde(default)]
    pub xtc_threshold: f64,
    #[serde(default)]
    pub xtc_probability: f64,
    #[serde(default)]
    pub dry_multiplier: f64,
    #[serde(default = "default_dry_base")]
    pub dry_base: f64,
    #[serde(default = "default_dry_allowed_length")]
    pub dry_allowed_length: i32,
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f64,
    #[serde(default = "default_repeat_last_n")]
    pub repeat_last_n: i32,
    /// Sampler application order, empty for runtime default
    #[serde(default)]
    pub samplers: Vec<String>,
    /// RNG seed, -1 for random
    #[serde(default = "default_seed")]
    pub seed: i64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_temperature() -> f64 {
    0.8
}

fn default_top_k() -> i32 {
    40
}

fn default_top_p() -> f64 {
    0.95
}

fn default_typical_p() -> f64 {
    1.0
}

fn default_dry_base() -> f64 {
    1.75
}

fn default_dry_allowed_length() -> i32 {
    2
}

fn default_repeat_penalty() -> f64 {
    1.1
}

fn default_repeat_last_n() -> i32 {
    64
}

fn default_seed() -> i64 {
    -1
}

fn default_max_tokens() -> u32 {
    1024
}

impl Default for SamplingParams {
    fn default() -> Self {
        SamplingParams {
            temperature: default_temperature(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            min_p: 0.0,
            typical_p: default_typical_p(),
            xtc_threshold: 0.0,
            xtc_probability: 0.0,
            dry_multiplier: 0.0,
            dry_base: default_dry_base(),
            dry_allowed_length: default_dry_allowed_length(),
            repeat_penalty: default_repeat_penalty(),
            repeat_last_n: default_repeat_last_n(),
            samplers: Vec::new(),
            seed: default_seed(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// Frames sent by the client over the push channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    StartSession {
        session_id: String,
    },
    ResumeSession {
        session_id: String,
    },
    ChatMessage {
        session_id: String,
        message: String,
        #[serde(default)]
        params: SamplingParams,
    },
    EndSession {
        session_id: String,
    },
}

/// Frames pushed by the coordinator over the push channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    SessionStarted {
        session_id: String,
        node_id: String,
        expires_at: i64,
    },
    ModelStatus {
        session_id: String,
        /// "downloading", "loading" or "ready"
        status: String,
        message: String,
    },
    SessionReady {
        session_id: String,
    },
    AiToken {
        session_id: String,
        token: String,
        is_final: bool,
    },
    AiResponse {
        session_id: String,
        response: String,
        streaming_complete: bool,
    },
    SessionEnded {
        session_id: String,
        reason: String,
    },
    NodeFreed {
        node_id: String,
    },
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampling_params_fill_defaults() {
        let params: SamplingParams = serde_json::from_str("{}").unwrap();

        assert_eq!(params, SamplingParams::default());

        let params: SamplingParams =
            serde_json::from_str(r#"{"temperature": 0.2, "seed": 42}"#).unwrap();

        assert_eq!(params.temperature, 0.2);
        assert_eq!(params.seed, 42);
        assert_eq!(params.max_tokens, 1024);
    }

    #[test]
    fn frames_use_snake_case_tags() {
        let frame: ClientFrame = serde_json::from_str(
            r#"{"type": "chat_message", "session_id": "s1", "message": "hi"}"#,
        )
        .unwrap();

        assert!(matches!(frame, ClientFrame::ChatMessage { .. }));

        let encoded = serde_json::to_string(&ServerFrame::AiToken {
            session_id: "s1".to_string(),
            token: "x".to_string(),
            is_final: false,
        })
        .unwrap();

        assert!(encoded.contains(r#""type":"ai_token""#));
    }
}
