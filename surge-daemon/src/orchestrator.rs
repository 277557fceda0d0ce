use std::sync::Arc;
use std::time::Duration;

use bitcoin::hex::DisplayHex;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use surge_api_core::{NewSessionRequest, NewSessionResponse, SamplingParams, ServerFrame};
use surge_core::db::Database;
use surge_core::unix_time;
use surge_daemon_db::models::{
    InvoicePurpose, InvoiceRecord, InvoiceStatus, NodeRecord, SessionRecord, SessionState, TxType,
};

use crate::bridge;
use crate::db;
use crate::events::EventBus;
use crate::ledger;
use crate::lightning::{GatewayError, LightningGateway};
use crate::node_client::{LoadModelRequest, ModelLoadStatus, NodeRpc};
use crate::registry;

pub const PAYMENT_METHOD_LIGHTNING: &str = "lightning";
pub const PAYMENT_METHOD_WALLET: &str = "wallet";

/// Events a session actor can receive. Each live session has exactly one
/// actor task draining its mailbox, which linearizes all transitions for
/// that session id.
#[derive(Debug)]
pub enum SessionEvent {
    PaymentObserved,
    InvoiceExpired,
    CancelRequested,
    EndRequested,
    ExpiryTick,
    StartingTimeout,
    NodeReady,
    NodeLoadFailed(String),
    NodeFailed,
    ChatMessage {
        message: String,
        params: SamplingParams,
    },
    CancelGeneration,
    GenerationFinished,
}

#[derive(Clone)]
pub struct SessionConfig {
    pub commission_rate_ppm: u64,
    pub invoice_expiry_secs: u32,
    pub starting_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub token_idle_timeout_secs: u64,
    pub session_min_minutes: u32,
    pub session_max_minutes: u32,
}

#[derive(Clone)]
pub struct SessionContext {
    pub db: Database,
    pub gateway: Arc<dyn LightningGateway>,
    pub node_rpc: Arc<dyn NodeRpc>,
    pub event_bus: EventBus,
    pub manager: SessionManager,
    pub config: SessionConfig,
}

/// Mailbox registry. Values carry the owning user id so a lagging push
/// connection can cancel that user's generations.
#[derive(Clone, Default)]
pub struct SessionManager {
    mailboxes: Arc<DashMap<String, (String, mpsc::Sender<SessionEvent>)>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers to a live mailbox, handing the event back when none is
    /// registered for this session.
    pub async fn send(&self, session_id: &str, event: SessionEvent) -> Result<(), SessionEvent> {
        let tx = match self.mailboxes.get(session_id) {
            Some(entry) => entry.1.clone(),
            None => return Err(event),
        };

        tx.send(event).await.map_err(|e| e.0)
    }

    pub fn sessions_for_user(&self, user_id: &str) -> Vec<String> {
        self.mailboxes
            .iter()
            .filter(|entry| entry.value().0 == user_id)
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn register(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Option<mpsc::Receiver<SessionEvent>> {
        match self.mailboxes.entry(session_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let (tx, rx) = mpsc::channel(64);

                vacant.insert((user_id.to_string(), tx));

                Some(rx)
            }
        }
    }

    fn unregister(&self, session_id: &str) {
        self.mailboxes.remove(session_id);
    }
}

/// Delivers an event to the session's actor, respawning the actor from
/// its persisted row first if the coordinator restarted since it was
/// created. Events for terminal sessions are dropped.
pub async fn deliver(ctx: &SessionContext, session_id: &str, event: SessionEvent) {
    let event = match ctx.manager.send(session_id, event).await {
        Ok(()) => return,
        Err(event) => event,
    };

    let session = match db::get_session(&ctx.db, session_id).await {
        Some(session) => session,
        None => return,
    };

    if session.session_state().is_terminal() {
        return;
    }

    spawn_actor(ctx.clone(), session);

    ctx.manager.send(session_id, event).await.ok();
}

/// Re-arms actors for every session that was alive when the coordinator
/// went down.
pub async fn recover_sessions(ctx: &SessionContext) {
    for session in db::non_terminal_sessions(&ctx.db).await {
        info!(session_id = %session.id, state = %session.state, "recovering session");

        spawn_actor(ctx.clone(), session);
    }
}

/// Validation and admission for a new session: reserve the node first,
/// then raise the invoice, so a payment failure can always hand the
/// node back.
#[derive(Debug)]
pub enum NewSessionError {
    Validation(String),
    NodeBusy,
    InsufficientFunds,
    Lightning(GatewayError),
}

pub async fn new_session(
    ctx: &SessionContext,
    user_id: &str,
    request: &NewSessionRequest,
) -> Result<NewSessionResponse, NewSessionError> {
    let config = &ctx.config;

    if request.minutes < config.session_min_minutes || request.minutes > config.session_max_minutes
    {
        return Err(NewSessionError::Validation(format!(
            "Minutes must be between {} and {}",
            config.session_min_minutes, config.session_max_minutes
        )));
    }

    if request.payment_method != PAYMENT_METHOD_LIGHTNING
        && request.payment_method != PAYMENT_METHOD_WALLET
    {
        return Err(NewSessionError::Validation(
            "Unknown payment method".to_string(),
        ));
    }

    let node = registry::get_node(&ctx.db, &request.node_id)
        .await
        .ok_or_else(|| NewSessionError::Validation("Unknown node".to_string()))?;

    let (model_id, is_hf_download) = resolve_model(&node, request)?;

    let amount_sats = node.price_per_minute_sats * request.minutes as i64;

    if request.payment_method == PAYMENT_METHOD_WALLET
        && ledger::balance(&ctx.db, user_id).await < amount_sats
    {
        return Err(NewSessionError::InsufficientFunds);
    }

    let session_id = rand::rng().random::<[u8; 16]>().as_hex().to_string();

    if !registry::try_reserve(&ctx.db, &node.id, &session_id).await {
        return Err(NewSessionError::NodeBusy);
    }

    let mut invoice = None;
    let mut payment_reference = None;

    if request.payment_method == PAYMENT_METHOD_LIGHTNING {
        let created = ctx
            .gateway
            .create_invoice(
                amount_sats,
                &format!("Inference session {session_id}"),
                config.invoice_expiry_secs,
            )
            .await;

        let created = match created {
            Ok(created) => created,
            Err(e) => {
                registry::release(&ctx.db, &node.id, &session_id).await;

                return Err(NewSessionError::Lightning(e));
            }
        };

        db::create_invoice(
            &ctx.db,
            InvoiceRecord {
                payment_hash: created.payment_hash.clone(),
                bolt11: created.bolt11.clone(),
                amount_sats,
                purpose: InvoicePurpose::Session.as_str().to_string(),
                related_id: session_id.clone(),
                status: InvoiceStatus::Pending.as_str().to_string(),
                expires_at: created.expires_at,
                created_at: unix_time(),
            },
        )
        .await;

        payment_reference = Some(created.payment_hash.clone());
        invoice = Some(created.bolt11);
    }

    let session = SessionRecord {
        id: session_id.clone(),
        user_id: user_id.to_string(),
        node_id: node.id.clone(),
        model_id,
        is_hf_download,
        context_length: request.context_length as i64,
        minutes_purchased: request.minutes as i64,
        amount_sats,
        state: SessionState::PendingPayment.as_str().to_string(),
        payment_method: request.payment_method.clone(),
        payment_reference,
        created_at: unix_time(),
        paid_at: None,
        started_at: None,
        expires_at: None,
        ended_at: None,
    };

    db::create_session(&ctx.db, session.clone()).await;

    spawn_actor(ctx.clone(), session);

    info!(%session_id, node_id = %node.id, %amount_sats, "session created");

    Ok(NewSessionResponse {
        session_id,
        invoice,
        amount_sats,
        expires_at: unix_time() + config.invoice_expiry_secs as i64 * 1000,
    })
}

fn resolve_model(
    node: &NodeRecord,
    request: &NewSessionRequest,
) -> Result<(String, bool), NewSessionError> {
    if let Some(hf_repo) = &request.hf_repo {
        let repo = hf_repo.split(':').next().unwrap_or_default();

        let mut parts = repo.split('/');

        let valid = matches!(
            (parts.next(), parts.next(), parts.next()),
            (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty()
        );

        if !valid {
            return Err(NewSessionError::Validation(
                "Invalid HuggingFace repo, expected owner/name[:quant]".to_string(),
            ));
        }

        return Ok((hf_repo.clone(), true));
    }

    let model_id = request
        .model
        .as_ref()
        .ok_or_else(|| NewSessionError::Validation("Missing model".to_string()))?;

    let model = node
        .models()
        .into_iter()
        .find(|model| &model.id == model_id)
        .ok_or_else(|| {
            NewSessionError::Validation("Model not available on this node".to_string())
        })?;

    if (request.context_length as i64) > model.context_length {
        return Err(NewSessionError::Validation(format!(
            "Context length exceeds model maximum of {}",
            model.context_length
        )));
    }

    let max_vram = node
        .hardware()
        .gpus
        .iter()
        .map(|gpu| gpu.vram_mb)
        .max()
        .unwrap_or(0);

    if model.min_vram_mb > max_vram {
        return Err(NewSessionError::Validation(
            "Model does not fit on this node".to_string(),
        ));
    }

    Ok((model.id, false))
}

/// Integer minute ceiling used for early-end proration.
pub fn minutes_used(started_at: i64, ended_at: i64) -> i64 {
    let elapsed_ms = (ended_at - started_at).max(0);

    (elapsed_ms + 59_999) / 60_000
}

/// Splits a settlement amount into node owner earning and house
/// commission.
pub fn commission_split(amount_sats: i64, rate_ppm: u64) -> (i64, i64) {
    let commission = amount_sats * rate_ppm as i64 / 1_000_000;

    (amount_sats - commission, commission)
}

pub fn spawn_actor(ctx: SessionContext, session: SessionRecord) {
    let rx = match ctx.manager.register(&session.id, &session.user_id) {
        Some(rx) => rx,
        None => return,
    };

    tokio::spawn(async move {
        SessionActor {
            state: session.session_state(),
            ctx,
            session,
            rx,
            generation: None,
        }
        .run()
        .await;
    });
}

struct SessionActor {
    ctx: SessionContext,
    session: SessionRecord,
    state: SessionState,
    rx: mpsc::Receiver<SessionEvent>,
    generation: Option<CancellationToken>,
}

impl SessionActor {
    async fn run(mut self) {
        self.recover().await;

        while !self.state.is_terminal() {
            let event = match self.rx.recv().await {
                Some(event) => event,
                None => break,
            };

            self.handle(event).await;
        }

        self.ctx.manager.unregister(&self.session.id);
    }

    /// Resumes interrupted work after a respawn: re-dispatches the model
    /// load for starting sessions and finishes half-done settlements.
    /// All effects are keyed so replays are no-ops.
    async fn recover(&mut self) {
        match self.state {
            SessionState::Starting => self.dispatch_load().await,
            SessionState::Settling => self.settle_and_finish("ended").await,
            SessionState::Refunding => self.refund_and_finish("node_failed").await,
            _ => {}
        }
    }

    async fn handle(&mut self, event: SessionEvent) {
        match (self.state, event) {
            (SessionState::PendingPayment, SessionEvent::PaymentObserved) => {
                if !db::begin_starting(&self.ctx.db, &self.session.id).await {
                    return;
                }

                self.state = SessionState::Starting;

                info!(session_id = %self.session.id, "payment observed");

                self.push(ServerFrame::ModelStatus {
                    session_id: self.session.id.clone(),
                    status: "loading".to_string(),
                    message: "Preparing model".to_string(),
                });

                self.dispatch_load().await;
            }
            (
                SessionState::PendingPayment,
                SessionEvent::InvoiceExpired | SessionEvent::CancelRequested,
            ) => {
                if !db::end_session(&self.ctx.db, &self.session.id, SessionState::PendingPayment)
                    .await
                {
                    return;
                }

                self.state = SessionState::Ended;

                if let Some(payment_hash) = &self.session.payment_reference {
                    db::mark_invoice_expired(&self.ctx.db, payment_hash).await;
                }

                self.release_node().await;

                self.push(ServerFrame::SessionEnded {
                    session_id: self.session.id.clone(),
                    reason: "payment_expired".to_string(),
                });
            }
            (SessionState::PendingPayment, SessionEvent::NodeFailed) => {
                // Nothing was paid yet, close the session outright.
                if db::end_session(&self.ctx.db, &self.session.id, SessionState::PendingPayment)
                    .await
                {
                    self.state = SessionState::Ended;

                    self.release_node().await;

                    self.push(ServerFrame::SessionEnded {
                        session_id: self.session.id.clone(),
                        reason: "node_offline".to_string(),
                    });
                }
            }
            (SessionState::Starting, SessionEvent::NodeReady) => {
                let started_at = unix_time();

                let expires_at = started_at + self.session.minutes_purchased * 60_000;

                if !db::activate_session(&self.ctx.db, &self.session.id, started_at, expires_at)
                    .await
                {
                    return;
                }

                self.state = SessionState::Active;
                self.session.started_at = Some(started_at);
                self.session.expires_at = Some(expires_at);

                info!(session_id = %self.session.id, %expires_at, "session active");

                self.push(ServerFrame::SessionStarted {
                    session_id: self.session.id.clone(),
                    node_id: self.session.node_id.clone(),
                    expires_at,
                });

                self.push(ServerFrame::SessionReady {
                    session_id: self.session.id.clone(),
                });
            }
            (
                SessionState::Starting,
                SessionEvent::NodeLoadFailed(_)
                | SessionEvent::StartingTimeout
                | SessionEvent::NodeFailed,
            ) => {
                if !db::transition_session(
                    &self.ctx.db,
                    &self.session.id,
                    SessionState::Starting,
                    SessionState::Refunding,
                )
                .await
                {
                    return;
                }

                self.state = SessionState::Refunding;

                warn!(session_id = %self.session.id, "model start failed, refunding");

                self.push(ServerFrame::ModelStatus {
                    session_id: self.session.id.clone(),
                    status: "failed".to_string(),
                    message: "Model failed to start".to_string(),
                });

                self.refund_and_finish("node_failed").await;
            }
            (SessionState::Active, SessionEvent::ChatMessage { message, params }) => {
                self.handle_chat(message, params).await;
            }
            (SessionState::Active, SessionEvent::GenerationFinished) => {
                self.generation = None;
            }
            (SessionState::Active, SessionEvent::CancelGeneration) => {
                self.cancel_generation();
            }
            (SessionState::Active, SessionEvent::ExpiryTick) => {
                if unix_time() < self.session.expires_at.unwrap_or(0) {
                    return;
                }

                if !db::begin_settling(&self.ctx.db, &self.session.id).await {
                    return;
                }

                self.state = SessionState::Settling;

                self.cancel_generation();

                self.stop_model().await;

                self.settle_and_finish("expired").await;
            }
            (SessionState::Active, SessionEvent::EndRequested) => {
                if !db::begin_settling(&self.ctx.db, &self.session.id).await {
                    return;
                }

                self.state = SessionState::Settling;

                self.cancel_generation();

                self.stop_model().await;

                self.settle_and_finish("ended_by_user").await;
            }
            (SessionState::Active, SessionEvent::NodeFailed) => {
                if !db::transition_session(
                    &self.ctx.db,
                    &self.session.id,
                    SessionState::Active,
                    SessionState::Refunding,
                )
                .await
                {
                    return;
                }

                self.state = SessionState::Refunding;

                warn!(session_id = %self.session.id, "node failed mid-session, refunding");

                self.cancel_generation();

                self.refund_and_finish("node_failed").await;
            }
            (_, SessionEvent::ChatMessage { .. }) => {
                self.push(ServerFrame::Error {
                    message: "Session is not active".to_string(),
                });
            }
            (_, event) => {
                // Duplicate or late event for a state that has moved on.
                warn!(
                    session_id = %self.session.id,
                    state = %self.state,
                    ?event,
                    "ignoring event"
                );
            }
        }
    }

    async fn handle_chat(&mut self, message: String, params: SamplingParams) {
        if self.generation.is_some() {
            self.push(ServerFrame::Error {
                message: "busy".to_string(),
            });

            return;
        }

        if unix_time() >= self.session.expires_at.unwrap_or(0) {
            self.push(ServerFrame::Error {
                message: "Session expired".to_string(),
            });

            return;
        }

        let node = match registry::get_node(&self.ctx.db, &self.session.node_id).await {
            Some(node) => node,
            None => {
                self.push(ServerFrame::Error {
                    message: "Node no longer registered".to_string(),
                });

                return;
            }
        };

        let cancel = CancellationToken::new();

        self.generation = Some(cancel.clone());

        let mailbox = self
            .ctx
            .manager
            .mailboxes
            .get(&self.session.id)
            .map(|entry| entry.1.clone());

        if let Some(mailbox) = mailbox {
            tokio::spawn(bridge::run_generation(
                self.ctx.clone(),
                self.session.clone(),
                node.endpoint_url,
                message,
                params,
                cancel,
                mailbox,
            ));
        }
    }

    fn cancel_generation(&mut self) {
        if let Some(cancel) = self.generation.take() {
            cancel.cancel();
        }
    }

    /// Dispatches the model load and starts polling the node for
    /// readiness. The poller reports progress straight to the push
    /// channel and posts the outcome back to the mailbox.
    async fn dispatch_load(&mut self) {
        let request = LoadModelRequest {
            session_id: self.session.id.clone(),
            model_id: self.session.model_id.clone(),
            is_hf_download: self.session.is_hf_download,
            context_length: self.session.context_length,
        };

        let node = match registry::get_node(&self.ctx.db, &self.session.node_id).await {
            Some(node) => node,
            None => return,
        };

        let ctx = self.ctx.clone();
        let session = self.session.clone();

        tokio::spawn(async move {
            if let Err(e) = ctx.node_rpc.load_model(&node.endpoint_url, &request).await {
                deliver(&ctx, &session.id, SessionEvent::NodeLoadFailed(e.to_string())).await;

                return;
            }

            poll_model_status(ctx, session, node.endpoint_url).await;
        });
    }

    async fn stop_model(&self) {
        let node = match registry::get_node(&self.ctx.db, &self.session.node_id).await {
            Some(node) => node,
            None => return,
        };

        if let Err(e) = self
            .ctx
            .node_rpc
            .stop_model(&node.endpoint_url, &self.session.id)
            .await
        {
            warn!(session_id = %self.session.id, %e, "failed to stop model");
        }
    }

    /// Prorated settlement: the used share, minute ceiling, is split
    /// between node owner and house, the rest is refunded to the user's
    /// wallet. Expiry is the degenerate case where everything is used.
    async fn settle_and_finish(&mut self, reason: &str) {
        let session = db::get_session(&self.ctx.db, &self.session.id)
            .await
            .expect("Session disappeared");

        let ended_at = session.ended_at.unwrap_or_else(unix_time);

        let used_minutes = match session.started_at {
            Some(started_at) => {
                minutes_used(started_at, ended_at).min(session.minutes_purchased)
            }
            None => session.minutes_purchased,
        };

        let price = session.amount_sats / session.minutes_purchased.max(1);

        let used_sats = used_minutes * price;

        let refund_sats = session.amount_sats - used_sats;

        if refund_sats > 0 {
            let refunded = ledger::credit(
                &self.ctx.db,
                &format!("{}-refund", session.id),
                &session.user_id,
                refund_sats,
                TxType::Refund,
                "Unused session time",
                Some(&session.id),
            )
            .await;

            if let Err(e) = refunded {
                warn!(session_id = %session.id, %e, "failed to refund unused time");
            }
        }

        let (earning_sats, commission_sats) =
            commission_split(used_sats, self.ctx.config.commission_rate_ppm);

        let node = registry::get_node(&self.ctx.db, &session.node_id).await;

        if let Some(node) = &node {
            let settled = ledger::settle(
                &self.ctx.db,
                &session.id,
                &node.owner_id,
                earning_sats,
                commission_sats,
                &format!("Session {} settlement", session.id),
            )
            .await;

            if let Err(e) = settled {
                warn!(session_id = %session.id, %e, "failed to settle session");
            }
        }

        info!(
            session_id = %session.id,
            %used_minutes,
            %earning_sats,
            %commission_sats,
            %refund_sats,
            "session settled"
        );

        self.finish(SessionState::Settling, reason).await;
    }

    /// Full refund, used when the coordinator, not the user, decided the
    /// session cannot continue.
    async fn refund_and_finish(&mut self, reason: &str) {
        let session = &self.session;

        if session.paid_at.is_some() || session.payment_method == PAYMENT_METHOD_WALLET {
            let refunded = ledger::credit(
                &self.ctx.db,
                &format!("{}-refund", session.id),
                &session.user_id,
                session.amount_sats,
                TxType::Refund,
                "Session failed before completion",
                Some(&session.id),
            )
            .await;

            if let Err(e) = refunded {
                warn!(session_id = %session.id, %e, "failed to refund session");
            }
        }

        self.finish(SessionState::Refunding, reason).await;
    }

    async fn finish(&mut self, from: SessionState, reason: &str) {
        db::end_session(&self.ctx.db, &self.session.id, from).await;

        self.state = SessionState::Ended;

        self.release_node().await;

        self.push(ServerFrame::SessionEnded {
            session_id: self.session.id.clone(),
            reason: reason.to_string(),
        });
    }

    async fn release_node(&self) {
        if registry::release(&self.ctx.db, &self.session.node_id, &self.session.id).await {
            self.ctx.event_bus.send_broadcast(ServerFrame::NodeFreed {
                node_id: self.session.node_id.clone(),
            });
        }
    }

    fn push(&self, frame: ServerFrame) {
        self.ctx.event_bus.send_to_user(&self.session.user_id, frame);
    }
}

/// Polls the node until the model is ready or failed, forwarding
/// progress to the user. The starting deadline itself is enforced by the
/// scheduler so it survives coordinator restarts.
async fn poll_model_status(ctx: SessionContext, session: SessionRecord, endpoint: String) {
    let mut last_status = String::new();

    loop {
        tokio::time::sleep(Duration::from_secs(2)).await;

        match db::get_session(&ctx.db, &session.id).await {
            Some(current) if current.session_state() == SessionState::Starting => {}
            _ => return,
        }

        match ctx.node_rpc.model_status(&endpoint, &session.id).await {
            Ok(ModelLoadStatus::Ready) => {
                deliver(&ctx, &session.id, SessionEvent::NodeReady).await;

                return;
            }
            Ok(ModelLoadStatus::Failed { message }) => {
                deliver(&ctx, &session.id, SessionEvent::NodeLoadFailed(message)).await;

                return;
            }
            Ok(ModelLoadStatus::Downloading { message }) => {
                if last_status != format!("downloading:{message}") {
                    last_status = format!("downloading:{message}");

                    ctx.event_bus.send_to_user(
                        &session.user_id,
                        ServerFrame::ModelStatus {
                            session_id: session.id.clone(),
                            status: "downloading".to_string(),
                            message,
                        },
                    );
                }
            }
            Ok(ModelLoadStatus::Loading) => {
                if last_status != "loading" {
                    last_status = "loading".to_string();

                    ctx.event_bus.send_to_user(
                        &session.user_id,
                        ServerFrame::ModelStatus {
                            session_id: session.id.clone(),
                            status: "loading".to_string(),
                            message: "Loading model".to_string(),
                        },
                    );
                }
            }
            Err(e) => {
                // Transient, the scheduler's starting deadline bounds how
                // long we keep retrying.
                warn!(session_id = %session.id, %e, "model status poll failed");
            }
        }
    }
}
