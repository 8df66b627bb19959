//! Background reconciliation.
//!
//! On every tick the daemon polls the gateway for payouts stuck in
//! `processing` and then re-derives every cached balance from the ledger.
//! Creators found inconsistent are frozen by the ledger and announced on
//! the event bus.

use std::sync::Arc;
use std::time::Duration;

use creatorpay_ledger::ReconcileReport;
use creatorpay_payout::StaleReport;
use creatorpay_types::unix_now;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::commands::ledger::emit_frozen;
use crate::events::Event;
use crate::DaemonState;

/// What one tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    pub stale: StaleReport,
    pub ledger: ReconcileReport,
}

/// Run until shutdown. An interval of 0 disables the loop.
pub async fn run(state: Arc<DaemonState>, mut shutdown: broadcast::Receiver<()>) {
    let secs = state.config.payout.reconcile_interval_secs;
    if secs == 0 {
        info!("background reconciliation disabled");
        return;
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval_secs = secs, "background reconciliation started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = tick(&state).await {
                    warn!("reconciliation tick failed: {}", e);
                }
            }
            _ = shutdown.recv() => {
                info!("background reconciliation stopped");
                break;
            }
        }
    }
}

/// One reconciliation pass.
pub async fn tick(state: &Arc<DaemonState>) -> anyhow::Result<TickReport> {
    let worker = state.clone();
    let report = tokio::task::spawn_blocking(move || -> anyhow::Result<TickReport> {
        let now = unix_now();
        let stale = worker.payouts.reconcile_stale(worker.gateway.as_ref(), now)?;
        let ledger = worker.balances.reconcile_all(now)?;
        Ok(TickReport { stale, ledger })
    })
    .await??;

    for request_id in &report.stale.settled {
        state.event_bus.emit(Event::now(
            "PayoutReconciled",
            json!({ "request_id": request_id }),
        ));
    }
    for creator_id in &report.ledger.frozen {
        emit_frozen(state, creator_id, "reconciliation mismatch");
    }
    Ok(report)
}
