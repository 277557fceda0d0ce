use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use surge_api_core::{SamplingParams, ServerFrame};
use surge_core::unix_time;
use surge_daemon_db::models::SessionRecord;

use crate::node_client::{GenerateRequest, NodeRpc};
use crate::orchestrator::{SessionContext, SessionEvent};

/// One in-flight generation for an active session: relays the node's
/// token frames to the user and accumulates the final response. Frames
/// stop flowing the moment the session expires, and a node that goes
/// quiet mid-stream trips the per-token idle deadline.
pub async fn run_generation(
    ctx: SessionContext,
    session: SessionRecord,
    endpoint: String,
    message: String,
    params: SamplingParams,
    cancel: CancellationToken,
    mailbox: mpsc::Sender<SessionEvent>,
) {
    if let Err(error) = relay(&ctx, &session, &endpoint, message, params, cancel).await {
        warn!(session_id = %session.id, %error, "generation failed");

        ctx.event_bus.send_to_user(
            &session.user_id,
            ServerFrame::Error { message: error },
        );
    }

    mailbox.send(SessionEvent::GenerationFinished).await.ok();
}

async fn relay(
    ctx: &SessionContext,
    session: &SessionRecord,
    endpoint: &str,
    message: String,
    params: SamplingParams,
    cancel: CancellationToken,
) -> Result<(), String> {
    let request = GenerateRequest {
        session_id: session.id.clone(),
        message,
        params,
    };

    let mut stream = ctx
        .node_rpc
        .generate(endpoint, &request)
        .await
        .map_err(|e| e.to_string())?;

    let idle_deadline = Duration::from_secs(ctx.config.token_idle_timeout_secs);

    let expires_at = session.expires_at.unwrap_or(0);

    let mut response = String::new();

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                info!(session_id = %session.id, "generation cancelled");

                return Ok(());
            }
            next = tokio::time::timeout(idle_deadline, stream.next()) => match next {
                Err(_) => return Err("Generation timed out".to_string()),
                Ok(None) => return Err("Generation ended unexpectedly".to_string()),
                Ok(Some(Err(e))) => return Err(e.to_string()),
                Ok(Some(Ok(frame))) => frame,
            },
        };

        if unix_time() >= expires_at {
            return Ok(());
        }

        response.push_str(&frame.token);

        ctx.event_bus.send_to_user(
            &session.user_id,
            ServerFrame::AiToken {
                session_id: session.id.clone(),
                token: frame.token,
                is_final: frame.is_final,
            },
        );

        if frame.is_final {
            ctx.event_bus.send_to_user(
                &session.user_id,
                ServerFrame::AiResponse {
                    session_id: session.id.clone(),
                    response,
                    streaming_complete: true,
                },
            );

            return Ok(());
        }
    }
}
