use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Json, Path, Query, State};
use axum::routing::{get, post};
use axum::Router;
use bitcoin::hashes::Hash;
use bitcoin::hex::DisplayHex;
use lightning_invoice::Bolt11Invoice;
use rand::Rng;
use serde::Deserialize;
use tracing::info;
use url::Url;

use surge_api_core::{
    AvailableModelsResponse, CheckPaymentResponse, DepositCheckResponse, DepositRequest,
    DepositResponse, HeartbeatRequest, HeartbeatResponse, LoginRequest, LoginResponse, MeResponse,
    ModelInfo, NewSessionRequest, NewSessionResponse, OnlineNodesResponse, PaySessionRequest,
    PaySessionResponse, RegisterNodeRequest, RegisterNodeResponse, RegisterRequest,
    RegisterResponse, TransactionsResponse, WithdrawRequest, WithdrawResponse,
};
use surge_core::unix_time;
use surge_daemon_db::models::{
    InvoicePurpose, InvoiceRecord, InvoiceStatus, NodeStatus, SessionState, TxType, UserRecord,
};

use crate::auth::{AuthUser, hash_password, new_token};
use crate::convert;
use crate::error::ApiError;
use crate::ledger;
use crate::lightning::{self, LightningGateway};
use crate::orchestrator::{self, SessionEvent, deliver};
use crate::registry;
use crate::{AppState, db, ws};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/register", post(register))
        .route("/api/login", post(login))
        .route("/api/me", get(me))
        .route("/api/models/available", get(available_models))
        .route("/api/nodes/online", get(online_nodes))
        .route("/api/register_node", post(register_node))
        .route("/api/node_heartbeat", post(node_heartbeat))
        .route("/api/new_session", post(new_session))
        .route("/api/session/{id}/check_payment", get(check_payment))
        .route("/api/wallet/deposit", post(deposit))
        .route("/api/wallet/deposit/check/{hash}", get(deposit_check))
        .route("/api/wallet/pay_session", post(pay_session))
        .route("/api/wallet/withdraw", post(withdraw))
        .route("/api/wallet/transactions", get(transactions))
        .route("/api/ws", get(ws::ws_handler))
}

#[tracing::instrument(skip(state, request))]
pub async fn register(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    if !state
        .rate_limiter
        .check(&addr.ip().to_string(), "register", 5)
    {
        return Err(ApiError::rate_limited("Too many registrations"));
    }

    let name = request.name.trim();

    if name.is_empty() || name.len() > 64 {
        return Err(ApiError::bad_request("Name must be 1-64 characters"));
    }

    if request.password.len() < 8 {
        return Err(ApiError::bad_request("Password must be at least 8 characters"));
    }

    let token = new_token();

    let record = UserRecord {
        id: rand::rng().random::<[u8; 16]>().as_hex().to_string(),
        name: name.to_string(),
        password_hash: hash_password(&request.password),
        token: Some(token.clone()),
        is_admin: false,
        balance_sats: 0,
        created_at: unix_time(),
    };

    if !db::create_user(&state.db, record.clone()).await {
        return Err(ApiError::bad_request("Name already taken"));
    }

    info!(user_id = %record.id, "user registered");

    Ok(Json(RegisterResponse {
        user_id: record.id,
        token,
    }))
}

pub async fn login(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    if !state.rate_limiter.check(&addr.ip().to_string(), "login", 10) {
        return Err(ApiError::rate_limited("Too many login attempts"));
    }

    let user = db::get_user_by_name(&state.db, request.name.trim())
        .await
        .filter(|user| user.password_hash == hash_password(&request.password))
        .ok_or_else(|| ApiError::unauthorized("Invalid credentials"))?;

    let token = new_token();

    db::rotate_token(&state.db, &user.id, &token).await;

    Ok(Json(LoginResponse {
        user_id: user.id,
        token,
    }))
}

pub async fn me(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<MeResponse>, ApiError> {
    // Re-read so the balance reflects settlements since auth resolution.
    let user = db::get_user(&state.db, &user.id)
        .await
        .ok_or_else(|| ApiError::unauthorized("Unknown user"))?;

    Ok(Json(convert::into_me_response(user)))
}

pub async fn available_models(
    State(state): State<AppState>,
) -> Result<Json<AvailableModelsResponse>, ApiError> {
    let online = registry::nodes_with_status(&state.db, NodeStatus::Online).await;
    let busy = registry::nodes_with_status(&state.db, NodeStatus::Busy).await;

    let mut models: Vec<ModelInfo> = Vec::new();

    for node in &online {
        for model in node.models() {
            if !models.iter().any(|known| known.id == model.id) {
                models.push(model);
            }
        }
    }

    let mut busy_models: Vec<ModelInfo> = Vec::new();

    for node in &busy {
        for model in node.models() {
            let known = models.iter().any(|m| m.id == model.id)
                || busy_models.iter().any(|m| m.id == model.id);

            if !known {
                busy_models.push(model);
            }
        }
    }

    Ok(Json(AvailableModelsResponse {
        models,
        busy_models,
        total_nodes_online: (online.len() + busy.len()) as u32,
    }))
}

pub async fn online_nodes(
    State(state): State<AppState>,
) -> Result<Json<OnlineNodesResponse>, ApiError> {
    let mut nodes = Vec::new();

    for record in registry::nodes_with_status(&state.db, NodeStatus::Online).await {
        nodes.push(convert::into_node_listing(record, None));
    }

    for record in registry::nodes_with_status(&state.db, NodeStatus::Busy).await {
        let busy_until = db::active_session_for_node(&state.db, &record.id)
            .await
            .and_then(|session| session.expires_at);

        nodes.push(convert::into_node_listing(record, busy_until));
    }

    Ok(Json(OnlineNodesResponse { nodes }))
}

#[tracing::instrument(skip(state, user, request))]
pub async fn register_node(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(request): Json<RegisterNodeRequest>,
) -> Result<Json<RegisterNodeResponse>, ApiError> {
    if request.name.trim().is_empty() {
        return Err(ApiError::bad_request("Node name must not be empty"));
    }

    if request.price_per_minute_sats < 0 {
        return Err(ApiError::bad_request("Price must not be negative"));
    }

    Url::parse(&request.endpoint_url)
        .map_err(|_| ApiError::bad_request("Invalid endpoint url"))?;

    let record = registry::register_node(
        &state.db,
        &user.id,
        &request,
        state.args.registration_fee_sats,
    )
    .await?;

    Ok(Json(RegisterNodeResponse {
        node_id: record.id,
        registration_fee_sats: state.args.registration_fee_sats,
    }))
}

pub async fn node_heartbeat(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(request): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, ApiError> {
    let node = registry::get_node(&state.db, &request.node_id)
        .await
        .ok_or_else(|| ApiError::not_found("Unknown node"))?;

    if node.owner_id != user.id {
        return Err(ApiError::forbidden("Not the node owner"));
    }

    registry::heartbeat(&state.db, &request)
        .await
        .ok_or_else(|| ApiError::not_found("Unknown node"))?;

    Ok(Json(HeartbeatResponse { ok: true }))
}

#[tracing::instrument(skip(state, user, request))]
pub async fn new_session(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(request): Json<NewSessionRequest>,
) -> Result<Json<NewSessionResponse>, ApiError> {
    if !state.rate_limiter.check(&user.id, "new_session", 20) {
        return Err(ApiError::rate_limited("Too many session requests"));
    }

    let response = orchestrator::new_session(&state.ctx, &user.id, &request).await?;

    Ok(Json(response))
}

pub async fn check_payment(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(session_id): Path<String>,
) -> Result<Json<CheckPaymentResponse>, ApiError> {
    let session = db::get_session(&state.db, &session_id)
        .await
        .filter(|session| session.user_id == user.id)
        .ok_or_else(|| ApiError::not_found("Unknown session"))?;

    Ok(Json(CheckPaymentResponse {
        paid: session.paid_at.is_some(),
    }))
}

pub async fn deposit(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(request): Json<DepositRequest>,
) -> Result<Json<DepositResponse>, ApiError> {
    check_amount_bounds(&state, request.amount_sats)?;

    let created = state
        .ctx
        .gateway
        .create_invoice(
            request.amount_sats,
            "Wallet deposit",
            state.args.invoice_expiry_secs,
        )
        .await?;

    db::create_invoice(
        &state.db,
        InvoiceRecord {
            payment_hash: created.payment_hash.clone(),
            bolt11: created.bolt11.clone(),
            amount_sats: request.amount_sats,
            purpose: InvoicePurpose::Deposit.as_str().to_string(),
            related_id: user.id.clone(),
            status: InvoiceStatus::Pending.as_str().to_string(),
            expires_at: created.expires_at,
            created_at: unix_time(),
        },
    )
    .await;

    Ok(Json(DepositResponse {
        invoice: created.bolt11,
        payment_hash: created.payment_hash,
    }))
}

pub async fn deposit_check(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(payment_hash): Path<String>,
) -> Result<Json<DepositCheckResponse>, ApiError> {
    let invoice = db::get_invoice(&state.db, &payment_hash)
        .await
        .filter(|invoice| invoice.related_id == user.id)
        .ok_or_else(|| ApiError::not_found("Unknown deposit"))?;

    if invoice.status == InvoiceStatus::Pending.as_str() {
        if let Ok(lightning::InvoiceState::Paid { .. }) =
            state.ctx.gateway.lookup_invoice(&payment_hash).await
        {
            lightning::observe_settled_invoice(&state.ctx, &payment_hash).await;
        }
    }

    let invoice = db::get_invoice(&state.db, &payment_hash)
        .await
        .ok_or_else(|| ApiError::not_found("Unknown deposit"))?;

    Ok(Json(DepositCheckResponse {
        status: invoice.status,
    }))
}

#[tracing::instrument(skip(state, user))]
pub async fn pay_session(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(request): Json<PaySessionRequest>,
) -> Result<Json<PaySessionResponse>, ApiError> {
    let session = db::get_session(&state.db, &request.session_id)
        .await
        .filter(|session| session.user_id == user.id)
        .ok_or_else(|| ApiError::not_found("Unknown session"))?;

    if session.session_state() != SessionState::PendingPayment {
        return Err(ApiError::bad_request("Session is not awaiting payment"));
    }

    let new_balance = ledger::debit_for_session(
        &state.db,
        &session.id,
        &user.id,
        session.amount_sats,
        &format!("Inference session {}", session.id),
    )
    .await?;

    // The lightning invoice, if one was issued, must not settle the
    // session a second time.
    if let Some(payment_hash) = &session.payment_reference {
        db::mark_invoice_expired(&state.db, payment_hash).await;
    }

    deliver(&state.ctx, &session.id, SessionEvent::PaymentObserved).await;

    Ok(Json(PaySessionResponse {
        amount_paid_sats: session.amount_sats,
        new_balance_sats: new_balance,
    }))
}

#[tracing::instrument(skip(state, user, request))]
pub async fn withdraw(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(request): Json<WithdrawRequest>,
) -> Result<Json<WithdrawResponse>, ApiError> {
    check_amount_bounds(&state, request.amount_sats)?;

    let invoice: Bolt11Invoice = request
        .bolt11
        .parse()
        .map_err(|_| ApiError::bad_request("Invalid invoice"))?;

    let invoice_sats = invoice
        .amount_milli_satoshis()
        .map(|msat| (msat / 1000) as i64)
        .ok_or_else(|| ApiError::bad_request("Amountless invoices are not supported"))?;

    if invoice_sats != request.amount_sats {
        return Err(ApiError::bad_request("Amount does not match invoice"));
    }

    let payment_hash = invoice.payment_hash().to_byte_array().as_hex().to_string();

    if ledger::get_transaction(&state.db, &payment_hash).await.is_some() {
        return Err(ApiError::bad_request("Invoice already paid"));
    }

    let fee_sats = state.get_fee_sats(request.amount_sats);

    let new_balance = ledger::debit(
        &state.db,
        &payment_hash,
        &user.id,
        request.amount_sats,
        fee_sats,
        TxType::Withdrawal,
        "Lightning withdrawal",
        None,
    )
    .await?;

    if let Err(e) = state
        .ctx
        .gateway
        .pay_invoice(&request.bolt11, fee_sats)
        .await
    {
        ledger::credit(
            &state.db,
            &format!("{payment_hash}-refund"),
            &user.id,
            request.amount_sats + fee_sats,
            TxType::Refund,
            "Withdrawal failed",
            None,
        )
        .await
        .map_err(ApiError::internal)?;

        return Err(e.into());
    }

    Ok(Json(WithdrawResponse {
        fee_paid_sats: fee_sats,
        new_balance_sats: new_balance,
    }))
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub size: u32,
}

fn default_page_size() -> u32 {
    50
}

pub async fn transactions(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Query(query): Query<PageQuery>,
) -> Result<Json<TransactionsResponse>, ApiError> {
    let page_size = query.size.clamp(1, 100);

    let transactions = ledger::list_transactions(&state.db, &user.id, query.page, page_size)
        .await
        .into_iter()
        .map(convert::into_transaction_info)
        .collect();

    Ok(Json(TransactionsResponse {
        transactions,
        page: query.page,
        page_size,
    }))
}

fn check_amount_bounds(state: &AppState, amount_sats: i64) -> Result<(), ApiError> {
    if amount_sats < state.args.min_amount_sats as i64 {
        return Err(ApiError::bad_request(format!(
            "The minimum amount is {} sats",
            state.args.min_amount_sats
        )));
    }

    if amount_sats > state.args.max_amount_sats as i64 {
        return Err(ApiError::bad_request(format!(
            "The maximum amount is {} sats",
            state.args.max_amount_sats
        )));
    }

    Ok(())
}
