mod admin;
mod api;
mod auth;
mod bridge;
mod convert;
mod db;
mod error;
mod events;
mod ledger;
mod lightning;
mod node_client;
mod orchestrator;
mod rate_limit;
mod registry;
mod scheduler;
#[cfg(test)]
mod tests;
mod ws;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use clap::{ArgGroup, Parser};
use ldk_node::bitcoin::Network;
use ldk_node::{Builder, Node};
use tokio::net::TcpListener;
use tracing::info;
use url::Url;

use surge_core::db::Database;

use crate::events::EventBus;
use crate::lightning::LdkGateway;
use crate::node_client::HttpNodeClient;
use crate::orchestrator::{SessionConfig, SessionContext, SessionManager};
use crate::rate_limit::RateLimiter;

#[derive(Parser, Debug, Clone)]
#[command(group(
    ArgGroup::new("chain_source")
        .required(true)
        .multiple(false)
        .args(["bitcoind_rpc_url", "esplora_rpc_url"])
))]
struct Args {
    /// Directory path for storing coordinator data in a SQLite database.
    #[arg(long, env = "SURGE_DATA_DIR")]
    surge_data_dir: PathBuf,

    /// Directory path for storing LDK node data in a SQLite database.
    #[arg(long, env = "LDK_DATA_DIR")]
    ldk_data_dir: PathBuf,

    /// Bitcoin network to operate on, determines address formats and chain validation rules.
    #[arg(long, env = "BITCOIN_NETWORK")]
    bitcoin_network: Network,

    /// Bitcoin Core RPC URL for chain data access. Mutually exclusive with --esplora-rpc-url.
    #[arg(long, env = "BITCOIN_RPC_URL")]
    bitcoind_rpc_url: Option<Url>,

    /// Esplora API URL for chain data access. Mutually exclusive with --bitcoind-rpc-url.
    #[arg(long, env = "ESPLORA_RPC_URL")]
    esplora_rpc_url: Option<Url>,

    /// Name of the coordinator instance as displayed to users.
    #[arg(long, env = "DAEMON_NAME")]
    daemon_name: String,

    /// Network address and port for the public HTTP API and push channel.
    #[arg(long, env = "API_BIND", default_value = "0.0.0.0:8080")]
    api_bind: SocketAddr,

    /// Loopback address and port for the operator CLI API.
    #[arg(long, env = "CLI_BIND", default_value = "127.0.0.1:9090")]
    cli_bind: SocketAddr,

    /// Network address and port for the Lightning node to listen for peer connections.
    #[arg(long, env = "LDK_BIND", default_value = "0.0.0.0:9735")]
    ldk_bind: SocketAddr,

    /// Expiration time in seconds for all generated Lightning invoices,
    /// and for unpaid sessions.
    #[arg(long, env = "INVOICE_EXPIRY_SECS", default_value = "3600")]
    invoice_expiry_secs: u32,

    /// Share of each session payment retained by the coordinator, in
    /// parts per million.
    #[arg(long, env = "COMMISSION_RATE_PPM", default_value = "100000")]
    commission_rate_ppm: u64,

    /// One-time fee in satoshis debited when a compute node is registered.
    #[arg(long, env = "REGISTRATION_FEE_SATS", default_value = "1000")]
    registration_fee_sats: i64,

    /// Seconds of heartbeat silence after which a compute node counts as offline.
    #[arg(long, env = "HEARTBEAT_TIMEOUT_SECS", default_value = "60")]
    heartbeat_timeout_secs: u64,

    /// Interval in seconds between heartbeat liveness sweeps.
    #[arg(long, env = "HEARTBEAT_POLL_SECS", default_value = "5")]
    heartbeat_poll_secs: u64,

    /// Interval in seconds between Lightning invoice status polls.
    #[arg(long, env = "INVOICE_POLL_SECS", default_value = "3")]
    invoice_poll_secs: u64,

    /// Seconds a paid session may spend loading a preloaded model before
    /// it is refunded.
    #[arg(long, env = "STARTING_TIMEOUT_SECS", default_value = "600")]
    starting_timeout_secs: u64,

    /// Seconds a paid session may spend downloading and loading a
    /// HuggingFace model before it is refunded.
    #[arg(long, env = "DOWNLOAD_TIMEOUT_SECS", default_value = "1800")]
    download_timeout_secs: u64,

    /// Seconds without a token frame after which a generation is abandoned.
    #[arg(long, env = "TOKEN_IDLE_TIMEOUT_SECS", default_value = "180")]
    token_idle_timeout_secs: u64,

    /// Shortest purchasable session in minutes.
    #[arg(long, env = "SESSION_MIN_MINUTES", default_value = "1")]
    session_min_minutes: u32,

    /// Longest purchasable session in minutes.
    #[arg(long, env = "SESSION_MAX_MINUTES", default_value = "1440")]
    session_max_minutes: u32,

    /// Minimum amount in satoshis enforced across deposits and withdrawals.
    #[arg(long, env = "MIN_AMOUNT_SATS", default_value = "1")]
    min_amount_sats: u32,

    /// Maximum amount in satoshis enforced across deposits and withdrawals.
    #[arg(long, env = "MAX_AMOUNT_SATS", default_value = "1000000")]
    max_amount_sats: u32,

    /// Fee rate in parts per million (PPM) applied to withdrawals as a
    /// routing fee budget.
    #[arg(long, env = "FEE_PPM", default_value = "10000")]
    fee_ppm: u64,

    /// Fixed base fee in satoshis added to all withdrawals.
    #[arg(long, env = "BASE_FEE_SATS", default_value = "10")]
    base_fee_sats: i64,
}

#[derive(Clone)]
struct AppState {
    args: Args,
    db: Database,
    node: Arc<Node>,
    ctx: SessionContext,
    rate_limiter: RateLimiter,
}

impl AppState {
    fn get_fee_sats(&self, amount_sats: i64) -> i64 {
        amount_sats * self.args.fee_ppm as i64 / 1_000_000 + self.args.base_fee_sats
    }
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C handler");

    info!("Signal received, shutting down gracefully...");
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    ensure!(
        args.surge_data_dir.is_dir(),
        "Surge data dir is not a directory"
    );

    info!("Starting Surge coordinator...");

    let mut builder = Builder::new();

    builder.set_node_alias("surge-daemon".to_string())?;

    builder.set_storage_dir_path(args.ldk_data_dir.to_string_lossy().to_string());

    builder.set_network(args.bitcoin_network);

    // Set chain source based on which URL was provided
    match (args.bitcoind_rpc_url.clone(), args.esplora_rpc_url.clone()) {
        (Some(bitcoind_url), None) => {
            builder.set_chain_source_bitcoind_rpc(
                bitcoind_url
                    .host_str()
                    .context("Invalid bitcoind RPC URL: missing host")?
                    .to_string(),
                bitcoind_url
                    .port()
                    .context("Invalid bitcoind RPC URL: missing port")?,
                bitcoind_url.username().to_string(),
                bitcoind_url
                    .password()
                    .context("Invalid bitcoind RPC URL: missing password")?
                    .to_string(),
            );
        }
        (None, Some(esplora_url)) => {
            builder.set_chain_source_esplora(esplora_url.to_string(), None);
        }
        _ => panic!("XOR relation is enforced by argument group"),
    }

    builder
        .set_listening_addresses(vec![args.ldk_bind.into()])
        .context("Failed to set listening address")?;

    let node = Arc::new(builder.build().context("Failed to build LDK Node")?);

    let runtime = Arc::new(tokio::runtime::Runtime::new()?);

    node.start_with_runtime(runtime.clone())
        .context("Failed to start LDK Node")?;

    let db = Database::new(&args.surge_data_dir, surge_daemon_db::MIGRATIONS, 10)?;

    runtime.block_on(db::ensure_house_account(&db));

    let config = SessionConfig {
        commission_rate_ppm: args.commission_rate_ppm,
        invoice_expiry_secs: args.invoice_expiry_secs,
        starting_timeout_secs: args.starting_timeout_secs,
        download_timeout_secs: args.download_timeout_secs,
        token_idle_timeout_secs: args.token_idle_timeout_secs,
        session_min_minutes: args.session_min_minutes,
        session_max_minutes: args.session_max_minutes,
    };

    let ctx = SessionContext {
        db: db.clone(),
        gateway: Arc::new(LdkGateway::new(node.clone())),
        node_rpc: Arc::new(HttpNodeClient::new(Duration::from_secs(30))),
        event_bus: EventBus::new(1000),
        manager: SessionManager::new(),
        config,
    };

    let app_state = AppState {
        args: args.clone(),
        db: db.clone(),
        node: node.clone(),
        ctx: ctx.clone(),
        rate_limiter: RateLimiter::new(),
    };

    runtime.block_on(orchestrator::recover_sessions(&ctx));

    runtime.spawn(lightning::process_ldk_events(node.clone(), ctx.clone()));

    runtime.spawn(scheduler::run_expiry_loop(ctx.clone()));

    runtime.spawn(scheduler::run_heartbeat_loop(
        ctx.clone(),
        args.heartbeat_poll_secs,
        args.heartbeat_timeout_secs,
    ));

    runtime.spawn(scheduler::run_invoice_poll_loop(
        ctx.clone(),
        args.invoice_poll_secs,
    ));

    {
        let app_state = app_state.clone();
        let cli_bind = args.cli_bind;

        runtime.spawn(async move {
            let listener = TcpListener::bind(cli_bind)
                .await
                .expect("Failed to bind CLI address");

            axum::serve(listener, admin::router().with_state(app_state))
                .await
                .expect("CLI server failed");
        });
    }

    runtime.block_on(async {
        let listener = TcpListener::bind(args.api_bind)
            .await
            .context("Failed to bind API address")?;

        axum::serve(
            listener,
            api::router()
                .with_state(app_state)
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Failed to start HTTP server")
    })?;

    node.stop().context("Failed to stop LDK Node")?;

    info!("Graceful shutdown complete");

    Ok(())
}
