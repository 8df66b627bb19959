//! Ledger command handlers: event posting, balances, entries, reconciliation.

use std::sync::Arc;

use creatorpay_ledger::posting::REFERRER_OVERRIDE;
use creatorpay_ledger::{EntryFilter, LedgerError};
use creatorpay_types::event::RawEvent;
use creatorpay_types::ledger::{EntryStatus, RevenueEntry, RevenueSource};
use creatorpay_types::money::from_minor_units;
use creatorpay_types::{unix_now, EntryId, UserId};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{blocking, parse, Result};
use crate::events::Event;
use crate::rpc::RpcError;
use crate::DaemonState;

/// Largest page `list_entries` returns.
const MAX_PAGE: usize = 1_000;

#[derive(Deserialize)]
struct CreatorParams {
    creator_id: UserId,
}

#[derive(Deserialize)]
struct ListParams {
    creator_id: UserId,
    #[serde(default)]
    since: Option<u64>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct SumParams {
    creator_id: UserId,
    /// Empty = every source.
    #[serde(default)]
    sources: Vec<RevenueSource>,
    #[serde(default)]
    status: Option<EntryStatus>,
}

#[derive(Deserialize)]
struct CorrectionParams {
    entry_id: EntryId,
    memo: String,
}

#[derive(Deserialize)]
struct ReconcileParams {
    #[serde(default)]
    creator_id: Option<UserId>,
}

#[derive(Deserialize)]
struct UnfreezeParams {
    creator_id: UserId,
    operator: String,
}

/// Allocate a revenue event and append its entries.
pub async fn post_event(state: &Arc<DaemonState>, params: &Value) -> Result {
    let event: RawEvent = parse(params)?;
    let posted = blocking(state, move |s| Ok(s.poster.post(&event, unix_now())?)).await?;

    let allocation = &posted.allocation;
    let creator_id = allocation
        .drafts
        .first()
        .map(|d| d.creator_id.to_string())
        .unwrap_or_default();
    state.event_bus.emit(Event::now(
        "RevenuePosted",
        json!({
            "creator_id": creator_id,
            "gross": allocation.gross,
            "creator_net": allocation.creator_net,
            "referrer_id": posted.referrer_id,
            "referrer_net": allocation.referrer_net,
            "entry_ids": posted.entry_ids,
        }),
    ));
    if let Some(named) = &posted.overridden_referrer {
        state.event_bus.emit(Event::now(
            "LedgerAnomaly",
            json!({
                "creator_id": creator_id,
                "kind": REFERRER_OVERRIDE,
                "amount": "0",
                "detail": format!("event named referrer {named}, bound referrer kept"),
            }),
        ));
    }
    if let Some(anomaly) = &allocation.anomaly {
        state.event_bus.emit(Event::now(
            "LedgerAnomaly",
            json!({
                "creator_id": anomaly.creator_id,
                "kind": anomaly.kind,
                "amount": anomaly.amount,
                "detail": anomaly.detail,
            }),
        ));
    }

    Ok(json!(posted))
}

/// Current balance of a creator.
pub async fn get_balance(state: &Arc<DaemonState>, params: &Value) -> Result {
    let CreatorParams { creator_id } = parse(params)?;
    blocking(state, move |s| {
        let balance = s.balances.get_balance(&creator_id, unix_now())?;
        let frozen_reason = s.store.frozen_reason(&creator_id)?;
        Ok(json!({
            "creator_id": creator_id,
            "balance": balance,
            "frozen_reason": frozen_reason,
        }))
    })
    .await
}

/// A creator's entries in time order.
pub async fn list_entries(state: &Arc<DaemonState>, params: &Value) -> Result {
    let ListParams {
        creator_id,
        since,
        limit,
    } = parse(params)?;
    let limit = limit.unwrap_or(100).min(MAX_PAGE);
    blocking(state, move |s| {
        let entries = s
            .store
            .list_by_creator(&creator_id, since)
            .take(limit)
            .collect::<std::result::Result<Vec<RevenueEntry>, LedgerError>>()?;
        Ok(json!({ "creator_id": creator_id, "entries": entries }))
    })
    .await
}

/// Offset an earlier entry with a linked negative entry.
pub async fn append_correction(state: &Arc<DaemonState>, params: &Value) -> Result {
    let CorrectionParams { entry_id, memo } = parse(params)?;
    let correction = blocking(state, move |s| {
        Ok(s.store.append_correction(entry_id, &memo, unix_now())?)
    })
    .await?;
    state.event_bus.emit(Event::now(
        "LedgerEntryCorrected",
        json!({
            "creator_id": correction.creator_id,
            "entry_id": correction.id,
            "reverses_entry_id": entry_id,
            "net": correction.net_amount,
        }),
    ));
    Ok(json!(correction))
}

/// Sum of net amounts matching a source/status filter.
pub async fn sum_entries(state: &Arc<DaemonState>, params: &Value) -> Result {
    let SumParams {
        creator_id,
        sources,
        status,
    } = parse(params)?;
    let mut filter = if sources.is_empty() {
        EntryFilter::all()
    } else {
        EntryFilter::sources(sources)
    };
    if let Some(status) = status {
        filter = filter.with_status(status);
    }
    blocking(state, move |s| {
        let total = s.store.sum_by_creator(&creator_id, &filter)?;
        Ok(json!({ "creator_id": creator_id, "total": total }))
    })
    .await
}

/// Reconcile one creator, or every creator when none is named.
pub async fn reconcile_ledger(state: &Arc<DaemonState>, params: &Value) -> Result {
    let ReconcileParams { creator_id } = parse(params)?;
    let now = unix_now();

    match creator_id {
        Some(creator_id) => {
            let outcome = blocking(state, move |s| Ok(s.balances.reconcile(&creator_id, now))).await?;
            match outcome {
                Ok(balance) => Ok(json!({ "checked": 1, "frozen": [], "balance": balance })),
                Err(LedgerError::LedgerInconsistency { creator_id, detail }) => {
                    emit_frozen(state, &creator_id, &detail);
                    Err(RpcError::ledger_inconsistency(creator_id.as_str(), &detail))
                }
                Err(e) => Err(e.into()),
            }
        }
        None => {
            let report = blocking(state, move |s| Ok(s.balances.reconcile_all(now)?)).await?;
            for creator_id in &report.frozen {
                emit_frozen(state, creator_id, "reconciliation mismatch");
            }
            Ok(json!(report))
        }
    }
}

/// Anomalies recorded against a creator.
pub async fn list_anomalies(state: &Arc<DaemonState>, params: &Value) -> Result {
    let CreatorParams { creator_id } = parse(params)?;
    blocking(state, move |s| {
        let rows = s.store.anomalies(&creator_id)?;
        let anomalies: Vec<Value> = rows
            .iter()
            .map(|row| {
                json!({
                    "kind": row.kind,
                    "detail": row.detail,
                    "amount": from_minor_units(row.amount_minor),
                    "at": row.at,
                })
            })
            .collect();
        Ok(json!({ "creator_id": creator_id, "anomalies": anomalies }))
    })
    .await
}

/// Lift a freeze after manual review.
pub async fn unfreeze_creator(state: &Arc<DaemonState>, params: &Value) -> Result {
    let UnfreezeParams {
        creator_id,
        operator,
    } = parse(params)?;
    if operator.trim().is_empty() {
        return Err(RpcError::invalid_params("operator required"));
    }
    let event_creator = creator_id.clone();
    let event_operator = operator.clone();
    let lifted = blocking(state, move |s| Ok(s.store.unfreeze(&creator_id, &operator)?)).await?;
    if lifted {
        state.event_bus.emit(Event::now(
            "CreatorUnfrozen",
            json!({ "creator_id": event_creator, "operator": event_operator }),
        ));
    }
    Ok(json!({ "unfrozen": lifted }))
}

pub(crate) fn emit_frozen(state: &DaemonState, creator_id: &UserId, detail: &str) {
    state.event_bus.emit(Event::now(
        "CreatorFrozen",
        json!({ "creator_id": creator_id, "detail": detail }),
    ));
}
