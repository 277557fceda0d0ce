use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bitcoin::hex::DisplayHex;
use diesel::{ExpressionMethods, QueryDsl, RunQueryDsl};
use rand::Rng;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use surge_api_core::{
    GpuInfo, HardwareInfo, ModelInfo, NewSessionRequest, RegisterNodeRequest, SamplingParams,
    ServerFrame,
};
use surge_core::db::Database;
use surge_core::unix_time;
use surge_daemon_db::models::{NodeStatus, SessionRecord, SessionState, TxType, UserRecord};
use surge_daemon_db::schema::session;

use crate::bridge;
use crate::db;
use crate::events::EventBus;
use crate::ledger;
use crate::lightning::{
    self, CreatedInvoice, GatewayError, InvoiceState, LightningGateway, SendOutcome,
};
use crate::node_client::{
    GenerateRequest, LoadModelRequest, ModelLoadStatus, NodeRpc, NodeRpcError, TokenFrame,
    TokenStream,
};
use crate::orchestrator::{
    self, PAYMENT_METHOD_LIGHTNING, PAYMENT_METHOD_WALLET, SessionConfig, SessionContext,
    SessionEvent, SessionManager, deliver,
};
use crate::registry;

pub async fn test_database() -> Database {
    let dir = std::env::temp_dir().join(format!(
        "surge-test-{}",
        rand::rng().random::<[u8; 8]>().as_hex()
    ));

    std::fs::create_dir_all(&dir).expect("Failed to create test dir");

    let db = Database::new(&dir, surge_daemon_db::MIGRATIONS, 5).expect("Failed to open test db");

    db::ensure_house_account(&db).await;

    db
}

pub async fn seed_user(db: &Database, name: &str, balance_sats: i64) -> UserRecord {
    let record = UserRecord {
        id: rand::rng().random::<[u8; 16]>().as_hex().to_string(),
        name: name.to_string(),
        password_hash: String::new(),
        token: None,
        is_admin: false,
        balance_sats: 0,
        created_at: unix_time(),
    };

    assert!(db::create_user(db, record.clone()).await);

    if balance_sats > 0 {
        ledger::credit(
            db,
            &format!("{}-seed", record.id),
            &record.id,
            balance_sats,
            TxType::Deposit,
            "Seed balance",
            None,
        )
        .await
        .expect("Failed to seed balance");
    }

    db::get_user(db, &record.id).await.unwrap()
}

pub fn node_request(price_per_minute_sats: i64) -> RegisterNodeRequest {
    RegisterNodeRequest {
        name: "rig".to_string(),
        endpoint_url: "http://node.test:7000".to_string(),
        price_per_minute_sats,
        hardware: HardwareInfo {
            cpu: "EPYC 7443".to_string(),
            ram_mb: 131072,
            disk_gb: 2000,
            gpus: vec![GpuInfo {
                name: "RTX 4090".to_string(),
                vram_mb: 24564,
            }],
        },
        models: vec![ModelInfo {
            id: "llama-3.1-8b-q4".to_string(),
            name: "Llama 3.1 8B".to_string(),
            architecture: "llama".to_string(),
            parameter_count_m: 8030,
            quantization: "Q4_K_M".to_string(),
            context_length: 8192,
            min_vram_mb: 6000,
        }],
    }
}

#[derive(Default)]
pub struct FakeGateway {
    pub invoices_created: AtomicUsize,
}

#[async_trait]
impl LightningGateway for FakeGateway {
    async fn create_invoice(
        &self,
        _amount_sats: i64,
        _memo: &str,
        expiry_secs: u32,
    ) -> Result<CreatedInvoice, GatewayError> {
        self.invoices_created.fetch_add(1, Ordering::SeqCst);

        let payment_hash = rand::rng().random::<[u8; 32]>().as_hex().to_string();

        Ok(CreatedInvoice {
            bolt11: format!("lnbcrt1-{payment_hash}"),
            payment_hash,
            expires_at: unix_time() + expiry_secs as i64 * 1000,
        })
    }

    async fn lookup_invoice(&self, _payment_hash: &str) -> Result<InvoiceState, GatewayError> {
        Ok(InvoiceState::Pending)
    }

    async fn pay_invoice(
        &self,
        _bolt11: &str,
        _max_fee_sats: i64,
    ) -> Result<SendOutcome, GatewayError> {
        Ok(SendOutcome {
            payment_id: rand::rng().random::<[u8; 32]>().as_hex().to_string(),
        })
    }
}

#[derive(Default)]
pub struct FakeNodeRpc {
    pub fail_load: bool,
    pub tokens: Vec<&'static str>,
}

impl FakeNodeRpc {
    fn streaming(tokens: Vec<&'static str>) -> Self {
        Self {
            fail_load: false,
            tokens,
        }
    }
}

#[async_trait]
impl NodeRpc for FakeNodeRpc {
    async fn load_model(
        &self,
        _endpoint: &str,
        _request: &LoadModelRequest,
    ) -> Result<(), NodeRpcError> {
        if self.fail_load {
            return Err(NodeRpcError::LoadFailed("out of memory".to_string()));
        }

        Ok(())
    }

    async fn model_status(
        &self,
        _endpoint: &str,
        _session_id: &str,
    ) -> Result<ModelLoadStatus, NodeRpcError> {
        Ok(ModelLoadStatus::Ready)
    }

    async fn generate(
        &self,
        _endpoint: &str,
        _request: &GenerateRequest,
    ) -> Result<TokenStream, NodeRpcError> {
        let count = self.tokens.len();

        let frames = self
            .tokens
            .clone()
            .into_iter()
            .enumerate()
            .map(move |(i, token)| {
                Ok(TokenFrame {
                    token: token.to_string(),
                    is_final: i + 1 == count,
                })
            })
            .collect::<Vec<_>>();

        Ok(Box::pin(futures::stream::iter(frames)))
    }

    async fn stop_model(&self, _endpoint: &str, _session_id: &str) -> Result<(), NodeRpcError> {
        Ok(())
    }
}

pub fn test_config() -> SessionConfig {
    SessionConfig {
        commission_rate_ppm: 100_000,
        invoice_expiry_secs: 3600,
        starting_timeout_secs: 600,
        download_timeout_secs: 1800,
        token_idle_timeout_secs: 180,
        session_min_minutes: 1,
        session_max_minutes: 1440,
    }
}

pub async fn test_context(gateway: Arc<FakeGateway>, node_rpc: Arc<FakeNodeRpc>) -> SessionContext {
    SessionContext {
        db: test_database().await,
        gateway,
        node_rpc,
        event_bus: EventBus::new(256),
        manager: SessionManager::new(),
        config: test_config(),
    }
}

pub async fn wait_for_session_state(db: &Database, session_id: &str, state: SessionState) {
    for _ in 0..300 {
        let current = db::get_session(db, session_id)
            .await
            .expect("Session not found")
            .session_state();

        if current == state {
            return;
        }

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    panic!("timed out waiting for session state {state}");
}

async fn force_session_window(db: &Database, session_id: &str, started_at: i64, expires_at: i64) {
    let mut conn = db.get_connection().await;

    diesel::update(session::table.find(session_id.to_string()))
        .set((
            session::started_at.eq(started_at),
            session::expires_at.eq(expires_at),
        ))
        .execute(&mut *conn)
        .expect("Failed to force session window");
}

pub async fn seed_pending_session(db: &Database, user_id: &str, amount_sats: i64) -> String {
    let record = SessionRecord {
        id: rand::rng().random::<[u8; 16]>().as_hex().to_string(),
        user_id: user_id.to_string(),
        node_id: "node".to_string(),
        model_id: "llama-3.1-8b-q4".to_string(),
        is_hf_download: false,
        context_length: 4096,
        minutes_purchased: 5,
        amount_sats,
        state: SessionState::PendingPayment.as_str().to_string(),
        payment_method: PAYMENT_METHOD_WALLET.to_string(),
        payment_reference: None,
        created_at: unix_time(),
        paid_at: None,
        started_at: None,
        expires_at: None,
        ended_at: None,
    };

    db::create_session(db, record.clone()).await;

    record.id
}

fn session_request(node_id: &str, minutes: u32, payment_method: &str) -> NewSessionRequest {
    NewSessionRequest {
        node_id: node_id.to_string(),
        model: Some("llama-3.1-8b-q4".to_string()),
        hf_repo: None,
        minutes,
        context_length: 4096,
        payment_method: payment_method.to_string(),
    }
}

async fn wallet_session_to_active(
    ctx: &SessionContext,
    user: &UserRecord,
    node_id: &str,
    minutes: u32,
) -> SessionRecord {
    let response = orchestrator::new_session(ctx, &user.id, &session_request(node_id, minutes, PAYMENT_METHOD_WALLET))
        .await
        .expect("Failed to create session");

    let session = db::get_session(&ctx.db, &response.session_id).await.unwrap();

    ledger::debit_for_session(
        &ctx.db,
        &session.id,
        &user.id,
        session.amount_sats,
        "Inference session",
    )
    .await
    .expect("Failed to pay session");

    deliver(ctx, &session.id, SessionEvent::PaymentObserved).await;

    wait_for_session_state(&ctx.db, &session.id, SessionState::Active).await;

    db::get_session(&ctx.db, &session.id).await.unwrap()
}

#[tokio::test]
async fn wallet_session_settles_on_expiry() {
    let ctx = test_context(Arc::default(), Arc::default()).await;

    let owner = seed_user(&ctx.db, "owner", 0).await;
    let user = seed_user(&ctx.db, "buyer", 10_000).await;

    let node = registry::register_node(&ctx.db, &owner.id, &node_request(100), 0)
        .await
        .unwrap();

    let session = wallet_session_to_active(&ctx, &user, &node.id, 5).await;

    // The node is exclusively held while the session runs.
    assert!(!registry::try_reserve(&ctx.db, &node.id, "other").await);

    let now = unix_time();

    force_session_window(&ctx.db, &session.id, now - 300_000, now - 1).await;

    deliver(&ctx, &session.id, SessionEvent::ExpiryTick).await;

    wait_for_session_state(&ctx.db, &session.id, SessionState::Ended).await;

    assert_eq!(ledger::balance(&ctx.db, &user.id).await, 9_500);
    assert_eq!(ledger::balance(&ctx.db, &owner.id).await, 450);
    assert_eq!(ledger::balance(&ctx.db, db::HOUSE_USER_ID).await, 50);

    let node = registry::get_node(&ctx.db, &node.id).await.unwrap();

    assert_eq!(node.node_status(), NodeStatus::Online);
    assert_eq!(node.current_session_id, None);
}

#[tokio::test]
async fn lightning_session_pays_node_owner() {
    let gateway = Arc::new(FakeGateway::default());

    let ctx = test_context(gateway.clone(), Arc::default()).await;

    let owner = seed_user(&ctx.db, "owner", 0).await;
    let user = seed_user(&ctx.db, "buyer", 0).await;

    let node = registry::register_node(&ctx.db, &owner.id, &node_request(100), 0)
        .await
        .unwrap();

    let response = orchestrator::new_session(
        &ctx,
        &user.id,
        &session_request(&node.id, 5, PAYMENT_METHOD_LIGHTNING),
    )
    .await
    .unwrap();

    assert!(response.invoice.is_some());
    assert_eq!(response.amount_sats, 500);

    let session = db::get_session(&ctx.db, &response.session_id).await.unwrap();

    let payment_hash = session.payment_reference.clone().unwrap();

    lightning::observe_settled_invoice(&ctx, &payment_hash).await;

    wait_for_session_state(&ctx.db, &session.id, SessionState::Active).await;

    let now = unix_time();

    force_session_window(&ctx.db, &session.id, now - 300_000, now - 1).await;

    deliver(&ctx, &session.id, SessionEvent::ExpiryTick).await;

    wait_for_session_state(&ctx.db, &session.id, SessionState::Ended).await;

    // Paid externally over Lightning: the buyer's wallet is untouched.
    assert_eq!(ledger::balance(&ctx.db, &user.id).await, 0);
    assert_eq!(ledger::balance(&ctx.db, &owner.id).await, 450);
    assert_eq!(ledger::balance(&ctx.db, db::HOUSE_USER_ID).await, 50);
}

#[tokio::test]
async fn concurrent_requests_race_for_node() {
    let gateway = Arc::new(FakeGateway::default());

    let ctx = test_context(gateway.clone(), Arc::default()).await;

    let owner = seed_user(&ctx.db, "owner", 0).await;
    let alice = seed_user(&ctx.db, "alice", 0).await;
    let bob = seed_user(&ctx.db, "bob", 0).await;

    let node = registry::register_node(&ctx.db, &owner.id, &node_request(100), 0)
        .await
        .unwrap();

    let request = session_request(&node.id, 5, PAYMENT_METHOD_LIGHTNING);

    let (a, b) = tokio::join!(
        orchestrator::new_session(&ctx, &alice.id, &request),
        orchestrator::new_session(&ctx, &bob.id, &request),
    );

    assert_eq!(a.is_ok() as u32 + b.is_ok() as u32, 1);

    assert!(matches!(
        [a, b].into_iter().find(|r| r.is_err()).unwrap(),
        Err(orchestrator::NewSessionError::NodeBusy)
    ));

    // The loser was turned away before any invoice was raised.
    assert_eq!(gateway.invoices_created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_model_load_refunds_in_full() {
    let node_rpc = Arc::new(FakeNodeRpc {
        fail_load: true,
        tokens: Vec::new(),
    });

    let ctx = test_context(Arc::default(), node_rpc).await;

    let owner = seed_user(&ctx.db, "owner", 0).await;
    let user = seed_user(&ctx.db, "buyer", 10_000).await;

    let node = registry::register_node(&ctx.db, &owner.id, &node_request(100), 0)
        .await
        .unwrap();

    let response = orchestrator::new_session(
        &ctx,
        &user.id,
        &session_request(&node.id, 5, PAYMENT_METHOD_WALLET),
    )
    .await
    .unwrap();

    ledger::debit_for_session(&ctx.db, &response.session_id, &user.id, 500, "Session")
        .await
        .unwrap();

    deliver(&ctx, &response.session_id, SessionEvent::PaymentObserved).await;

    wait_for_session_state(&ctx.db, &response.session_id, SessionState::Ended).await;

    assert_eq!(ledger::balance(&ctx.db, &user.id).await, 10_000);
    assert_eq!(ledger::balance(&ctx.db, &owner.id).await, 0);

    let node = registry::get_node(&ctx.db, &node.id).await.unwrap();

    assert_eq!(node.current_session_id, None);

    // Exactly one matching refund transaction.
    let refunds = ledger::list_transactions(&ctx.db, &user.id, 0, 100)
        .await
        .into_iter()
        .filter(|tx| tx.tx_type == TxType::Refund.as_str())
        .count();

    assert_eq!(refunds, 1);
}

#[tokio::test]
async fn early_end_prorates_at_minute_ceiling() {
    let ctx = test_context(Arc::default(), Arc::default()).await;

    let owner = seed_user(&ctx.db, "owner", 0).await;
    let user = seed_user(&ctx.db, "buyer", 10_000).await;

    let node = registry::register_node(&ctx.db, &owner.id, &node_request(100), 0)
        .await
        .unwrap();

    let session = wallet_session_to_active(&ctx, &user, &node.id, 8).await;

    let expires_at = session.expires_at.unwrap();

    // Two and a half minutes in, which prorates to three.
    force_session_window(&ctx.db, &session.id, unix_time() - 150_000, expires_at).await;

    deliver(&ctx, &session.id, SessionEvent::EndRequested).await;

    wait_for_session_state(&ctx.db, &session.id, SessionState::Ended).await;

    assert_eq!(ledger::balance(&ctx.db, &user.id).await, 9_700);
    assert_eq!(ledger::balance(&ctx.db, &owner.id).await, 270);
    assert_eq!(ledger::balance(&ctx.db, db::HOUSE_USER_ID).await, 30);
}

#[tokio::test]
async fn settlement_survives_restart_exactly_once() {
    let ctx = test_context(Arc::default(), Arc::default()).await;

    let owner = seed_user(&ctx.db, "owner", 0).await;
    let user = seed_user(&ctx.db, "buyer", 10_000).await;

    let node = registry::register_node(&ctx.db, &owner.id, &node_request(100), 0)
        .await
        .unwrap();

    let session = wallet_session_to_active(&ctx, &user, &node.id, 5).await;

    let now = unix_time();

    force_session_window(&ctx.db, &session.id, now - 300_000, now - 1).await;

    // Simulated restart: same database, fresh actors and event plumbing.
    let restarted = SessionContext {
        db: ctx.db.clone(),
        gateway: Arc::new(FakeGateway::default()),
        node_rpc: Arc::new(FakeNodeRpc::default()),
        event_bus: EventBus::new(256),
        manager: SessionManager::new(),
        config: test_config(),
    };

    orchestrator::recover_sessions(&restarted).await;

    deliver(&restarted, &session.id, SessionEvent::ExpiryTick).await;

    wait_for_session_state(&restarted.db, &session.id, SessionState::Ended).await;

    assert_eq!(ledger::balance(&restarted.db, &owner.id).await, 450);

    // A duplicated tick and a replayed settlement both leave the books
    // unchanged.
    deliver(&restarted, &session.id, SessionEvent::ExpiryTick).await;

    ledger::settle(&restarted.db, &session.id, &owner.id, 450, 50, "replay")
        .await
        .unwrap();

    assert_eq!(ledger::balance(&restarted.db, &owner.id).await, 450);
    assert_eq!(ledger::balance(&restarted.db, db::HOUSE_USER_ID).await, 50);
    assert_eq!(ledger::balance(&restarted.db, &user.id).await, 9_500);
}

#[tokio::test]
async fn new_session_validates_model_and_context() {
    let ctx = test_context(Arc::default(), Arc::default()).await;

    let owner = seed_user(&ctx.db, "owner", 0).await;
    let user = seed_user(&ctx.db, "buyer", 0).await;

    let node = registry::register_node(&ctx.db, &owner.id, &node_request(100), 0)
        .await
        .unwrap();

    let mut unknown_model = session_request(&node.id, 5, PAYMENT_METHOD_LIGHTNING);
    unknown_model.model = Some("mixtral-8x7b".to_string());

    assert!(matches!(
        orchestrator::new_session(&ctx, &user.id, &unknown_model).await,
        Err(orchestrator::NewSessionError::Validation(_))
    ));

    let mut oversized_context = session_request(&node.id, 5, PAYMENT_METHOD_LIGHTNING);
    oversized_context.context_length = 32_768;

    assert!(matches!(
        orchestrator::new_session(&ctx, &user.id, &oversized_context).await,
        Err(orchestrator::NewSessionError::Validation(_))
    ));

    let mut bad_repo = session_request(&node.id, 5, PAYMENT_METHOD_LIGHTNING);
    bad_repo.hf_repo = Some("not-a-repo".to_string());

    assert!(matches!(
        orchestrator::new_session(&ctx, &user.id, &bad_repo).await,
        Err(orchestrator::NewSessionError::Validation(_))
    ));

    let mut hf_repo = session_request(&node.id, 5, PAYMENT_METHOD_LIGHTNING);
    hf_repo.hf_repo = Some("unsloth/Llama-3.2-3B:Q4_K_M".to_string());

    let response = orchestrator::new_session(&ctx, &user.id, &hf_repo).await.unwrap();

    let session = db::get_session(&ctx.db, &response.session_id).await.unwrap();

    assert!(session.is_hf_download);
    assert_eq!(session.model_id, "unsloth/Llama-3.2-3B:Q4_K_M");
}

fn active_session_record(user_id: &str, expires_at: i64) -> SessionRecord {
    SessionRecord {
        id: rand::rng().random::<[u8; 16]>().as_hex().to_string(),
        user_id: user_id.to_string(),
        node_id: "node".to_string(),
        model_id: "llama-3.1-8b-q4".to_string(),
        is_hf_download: false,
        context_length: 4096,
        minutes_purchased: 5,
        amount_sats: 500,
        state: SessionState::Active.as_str().to_string(),
        payment_method: PAYMENT_METHOD_WALLET.to_string(),
        payment_reference: None,
        created_at: unix_time(),
        paid_at: Some(unix_time()),
        started_at: Some(unix_time()),
        expires_at: Some(expires_at),
        ended_at: None,
    }
}

#[tokio::test]
async fn bridge_relays_tokens_in_order() {
    let node_rpc = Arc::new(FakeNodeRpc::streaming(vec!["Hel", "lo ", "world"]));

    let ctx = test_context(Arc::default(), node_rpc).await;

    let session = active_session_record("buyer", unix_time() + 300_000);

    let mut events = Box::pin(ctx.event_bus.subscribe("buyer".to_string()));

    let (tx, mut rx) = mpsc::channel(8);

    bridge::run_generation(
        ctx.clone(),
        session.clone(),
        "http://node.test:7000".to_string(),
        "hi".to_string(),
        SamplingParams::default(),
        CancellationToken::new(),
        tx,
    )
    .await;

    assert!(matches!(
        rx.recv().await,
        Some(SessionEvent::GenerationFinished)
    ));

    let mut tokens = Vec::new();

    loop {
        match events.next().await {
            Some(Ok(ServerFrame::AiToken { token, .. })) => tokens.push(token),
            Some(Ok(ServerFrame::AiResponse {
                response,
                streaming_complete,
                ..
            })) => {
                assert_eq!(response, "Hello world");
                assert!(streaming_complete);

                break;
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    assert_eq!(tokens, vec!["Hel", "lo ", "world"]);
}

#[tokio::test]
async fn bridge_drops_frames_past_expiry() {
    let node_rpc = Arc::new(FakeNodeRpc::streaming(vec!["too", "late"]));

    let ctx = test_context(Arc::default(), node_rpc).await;

    let session = active_session_record("buyer", unix_time() - 1);

    let mut events = Box::pin(ctx.event_bus.subscribe("buyer".to_string()));

    let (tx, mut rx) = mpsc::channel(8);

    bridge::run_generation(
        ctx.clone(),
        session,
        "http://node.test:7000".to_string(),
        "hi".to_string(),
        SamplingParams::default(),
        CancellationToken::new(),
        tx,
    )
    .await;

    assert!(matches!(
        rx.recv().await,
        Some(SessionEvent::GenerationFinished)
    ));

    ctx.event_bus.send_to_user("buyer", ServerFrame::NodeFreed {
        node_id: "sentinel".to_string(),
    });

    // The sentinel arrives first: no token frames leaked out.
    assert!(matches!(
        events.next().await,
        Some(Ok(ServerFrame::NodeFreed { .. }))
    ));
}

#[test]
fn minute_ceiling() {
    assert_eq!(orchestrator::minutes_used(0, 0), 0);
    assert_eq!(orchestrator::minutes_used(0, 1), 1);
    assert_eq!(orchestrator::minutes_used(0, 60_000), 1);
    assert_eq!(orchestrator::minutes_used(0, 60_001), 2);
    assert_eq!(orchestrator::minutes_used(0, 150_000), 3);
    assert_eq!(orchestrator::minutes_used(1_000, 500), 0);
}

#[test]
fn commission_split_adds_up() {
    assert_eq!(orchestrator::commission_split(500, 100_000), (450, 50));
    assert_eq!(orchestrator::commission_split(300, 100_000), (270, 30));
    assert_eq!(orchestrator::commission_split(0, 100_000), (0, 0));
    assert_eq!(orchestrator::commission_split(1, 100_000), (1, 0));

    for amount in [1, 99, 1000, 12345] {
        let (earning, commission) = orchestrator::commission_split(amount, 250_000);

        assert_eq!(earning + commission, amount);
    }
}
