//! creatorpayd: the creator revenue ledger and payout daemon.
//!
//! Single OS process running a Tokio runtime. Clients talk to the daemon
//! with newline-delimited JSON-RPC 2.0 over a Unix socket. The engine
//! itself is synchronous; handlers run it on the blocking pool.

mod commands;
mod config;
mod events;
mod reconcile;
mod rpc;

use std::sync::Arc;

use creatorpay_db::SharedConnection;
use creatorpay_ledger::{BalanceCalculator, EventPoster, LedgerStore};
use creatorpay_payout::{ManualGateway, PaymentGateway, PayoutOrchestrator};
use creatorpay_referral::{AllowAll, ReferralResolver};
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::config::DaemonConfig;
use crate::events::{Event, EventBus};
use crate::rpc::RpcServer;

/// Daemon-wide shared state.
pub struct DaemonState {
    /// Database connection shared by every engine component.
    pub conn: SharedConnection,
    pub store: LedgerStore,
    pub balances: BalanceCalculator,
    pub poster: EventPoster,
    pub payouts: PayoutOrchestrator,
    pub resolver: ReferralResolver,
    /// Where approved payouts are sent.
    pub gateway: Arc<dyn PaymentGateway>,
    pub config: DaemonConfig,
    /// Event bus for pushing events to subscribers.
    pub event_bus: EventBus,
    /// Shutdown signal sender.
    pub shutdown_tx: broadcast::Sender<()>,
}

impl DaemonState {
    /// Wire the engine over an opened database.
    pub fn new(conn: rusqlite::Connection, config: DaemonConfig) -> anyhow::Result<Self> {
        if !config.referral.tiers.is_empty() {
            creatorpay_referral::config::replace_tiers(&conn, &config.referral.tiers)?;
            info!(tiers = config.referral.tiers.len(), "referral tiers loaded from config");
        }

        let conn = creatorpay_db::shared(conn);
        let resolver = ReferralResolver::new(Arc::new(AllowAll));
        let poster = EventPoster::new(conn.clone(), config.shares.clone(), resolver.clone())?;
        let payouts = PayoutOrchestrator::new(conn.clone(), config.payout.policy())?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            store: LedgerStore::new(conn.clone()),
            balances: BalanceCalculator::new(conn.clone()),
            poster,
            payouts,
            resolver,
            gateway: Arc::new(ManualGateway::new()),
            conn,
            config,
            event_bus: EventBus::new(1000),
            shutdown_tx,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = DaemonConfig::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("creatorpay={}", config.advanced.log_level).parse()?),
        )
        .init();

    info!("creatorpay daemon starting");

    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)?;

    let db_path = data_dir.join("creatorpay.db");
    let conn = creatorpay_db::open(&db_path)?;
    info!(path = ?db_path, "database opened");

    let state = Arc::new(DaemonState::new(conn, config)?);

    let socket_path = data_dir.join("creatorpay.sock");
    let rpc_server = RpcServer::new(state.clone(), socket_path.clone());
    info!("Starting JSON-RPC server on {:?}", socket_path);

    let reconciler = tokio::spawn(reconcile::run(state.clone(), state.shutdown_tx.subscribe()));

    state.event_bus.emit(Event::now(
        "DaemonStarted",
        serde_json::json!({ "version": env!("CARGO_PKG_VERSION") }),
    ));

    let mut shutdown_rx = state.shutdown_tx.subscribe();
    tokio::select! {
        result = rpc_server.run() => {
            if let Err(e) = result {
                error!("RPC server error: {}", e);
            }
        }
        _ = shutdown_rx.recv() => {
            info!("Shutdown signal received");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, shutting down");
        }
    }

    info!("Daemon shutting down gracefully");
    let _ = state.shutdown_tx.send(());
    if let Err(e) = reconciler.await {
        error!("reconcile loop ended abnormally: {}", e);
    }
    let _ = std::fs::remove_file(&socket_path);

    info!("Daemon stopped");
    Ok(())
}
