use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::StreamExt;
use serde::Deserialize;
use tracing::{info, warn};

use surge_api_core::{ClientFrame, ServerFrame};
use surge_core::unix_time;
use surge_daemon_db::models::{SessionState, UserRecord};

use crate::error::ApiError;
use crate::orchestrator::{SessionEvent, deliver};
use crate::{AppState, db};

#[derive(Deserialize)]
pub struct WsQuery {
    token: String,
}

/// Push channel entry point. Authentication happens once at upgrade
/// time; afterwards every inbound frame is resolved against the
/// connected user, never against anything the frame claims.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let user = db::get_user_by_token(&state.db, &query.token)
        .await
        .ok_or_else(|| ApiError::unauthorized("Invalid token"))?;

    Ok(ws.on_upgrade(move |socket| drive_connection(state, user, socket)))
}

async fn drive_connection(state: AppState, user: UserRecord, mut socket: WebSocket) {
    info!(user_id = %user.id, "push channel connected");

    let mut events = Box::pin(state.ctx.event_bus.subscribe(user.id.clone()));

    loop {
        tokio::select! {
            message = socket.recv() => {
                let message = match message {
                    Some(Ok(message)) => message,
                    Some(Err(_)) | None => break,
                };

                match message {
                    Message::Text(text) => {
                        if let Err(error) = handle_frame(&state, &user, text.as_str()).await {
                            send_frame(&mut socket, &ServerFrame::Error { message: error }).await;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            event = events.next() => {
                match event {
                    Some(Ok(frame)) => {
                        if !send_frame(&mut socket, &frame).await {
                            break;
                        }
                    }
                    Some(Err(_)) => {
                        // The subscriber lagged behind the broadcast
                        // buffer: stop the token firehose rather than
                        // silently dropping frames.
                        warn!(user_id = %user.id, "push channel lagging, cancelling generations");

                        for session_id in state.ctx.manager.sessions_for_user(&user.id) {
                            deliver(&state.ctx, &session_id, SessionEvent::CancelGeneration).await;
                        }

                        let frame = ServerFrame::Error {
                            message: "backpressure".to_string(),
                        };

                        if !send_frame(&mut socket, &frame).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    info!(user_id = %user.id, "push channel closed");
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> bool {
    let encoded = serde_json::to_string(frame).expect("Failed to serialize frame");

    socket.send(Message::Text(encoded.into())).await.is_ok()
}

async fn handle_frame(state: &AppState, user: &UserRecord, text: &str) -> Result<(), String> {
    let frame: ClientFrame =
        serde_json::from_str(text).map_err(|_| "Malformed frame".to_string())?;

    let session_id = match &frame {
        ClientFrame::StartSession { session_id }
        | ClientFrame::ResumeSession { session_id }
        | ClientFrame::ChatMessage { session_id, .. }
        | ClientFrame::EndSession { session_id } => session_id.clone(),
    };

    let session = db::get_session(&state.db, &session_id)
        .await
        .filter(|session| session.user_id == user.id)
        .ok_or_else(|| "Unknown session".to_string())?;

    match frame {
        ClientFrame::StartSession { .. } | ClientFrame::ResumeSession { .. } => {
            // Replay the session's current position on the push channel.
            let bus = &state.ctx.event_bus;

            match session.session_state() {
                SessionState::PendingPayment => {}
                SessionState::Starting => {
                    bus.send_to_user(
                        &user.id,
                        ServerFrame::ModelStatus {
                            session_id: session.id.clone(),
                            status: "loading".to_string(),
                            message: "Preparing model".to_string(),
                        },
                    );
                }
                SessionState::Active => {
                    bus.send_to_user(
                        &user.id,
                        ServerFrame::SessionStarted {
                            session_id: session.id.clone(),
                            node_id: session.node_id.clone(),
                            expires_at: session.expires_at.unwrap_or(unix_time()),
                        },
                    );

                    bus.send_to_user(
                        &user.id,
                        ServerFrame::SessionReady {
                            session_id: session.id.clone(),
                        },
                    );
                }
                SessionState::Settling | SessionState::Refunding | SessionState::Ended => {
                    bus.send_to_user(
                        &user.id,
                        ServerFrame::SessionEnded {
                            session_id: session.id.clone(),
                            reason: "ended".to_string(),
                        },
                    );
                }
            }

            Ok(())
        }
        ClientFrame::ChatMessage {
            message, params, ..
        } => {
            if session.session_state() != SessionState::Active {
                return Err("Session is not active".to_string());
            }

            deliver(
                &state.ctx,
                &session.id,
                SessionEvent::ChatMessage { message, params },
            )
            .await;

            Ok(())
        }
        ClientFrame::EndSession { .. } => match session.session_state() {
            SessionState::PendingPayment => {
                deliver(&state.ctx, &session.id, SessionEvent::CancelRequested).await;

                Ok(())
            }
            SessionState::Active => {
                deliver(&state.ctx, &session.id, SessionEvent::EndRequested).await;

                Ok(())
            }
            SessionState::Starting => Err("Session is still starting".to_string()),
            _ => Err("Session already ended".to_string()),
        },
    }
}
