//! Payout command handlers.

use std::sync::Arc;

use creatorpay_payout::{Decision, PayoutError, SettlementOutcome};
use creatorpay_types::payout::{PayoutMethod, PayoutRequest, PayoutStatus};
use creatorpay_types::{unix_now, RequestId, UserId};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{blocking, parse, Result};
use crate::commands::ledger::emit_frozen;
use crate::events::Event;
use crate::rpc::RpcError;
use crate::DaemonState;

#[derive(Deserialize)]
struct SubmitParams {
    creator_id: UserId,
    amount: Decimal,
    method: PayoutMethod,
    #[serde(default = "empty_details")]
    method_details: Value,
}

fn empty_details() -> Value {
    json!({})
}

#[derive(Deserialize)]
struct DecideParams {
    request_id: RequestId,
    decision: Decision,
    decided_by: UserId,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Deserialize)]
struct RequestParams {
    request_id: RequestId,
}

#[derive(Deserialize)]
struct SettleParams {
    request_id: RequestId,
    #[serde(flatten)]
    outcome: SettlementOutcome,
}

#[derive(Deserialize)]
struct CancelParams {
    request_id: RequestId,
    creator_id: UserId,
}

#[derive(Deserialize)]
struct ListParams {
    #[serde(default)]
    creator_id: Option<UserId>,
    #[serde(default)]
    status: Option<PayoutStatus>,
}

fn emit(state: &DaemonState, event_type: &str, request: &PayoutRequest) {
    state.event_bus.emit(Event::now(
        event_type,
        json!({
            "creator_id": request.creator_id,
            "request_id": request.id,
            "amount": request.requested_amount,
            "status": request.status,
        }),
    ));
}

/// Freezes triggered inside the orchestrator surface as an event too.
fn note_failure(state: &DaemonState, err: &PayoutError) {
    if let PayoutError::LedgerInconsistency { creator_id, detail } = err {
        emit_frozen(state, creator_id, detail);
    }
}

/// Open a payout request.
pub async fn submit_payout(state: &Arc<DaemonState>, params: &Value) -> Result {
    let SubmitParams {
        creator_id,
        amount,
        method,
        method_details,
    } = parse(params)?;
    let request = blocking(state, move |s| {
        Ok(s.payouts.submit(&creator_id, amount, method, method_details, unix_now())?)
    })
    .await?;
    emit(state, "PayoutRequested", &request);
    Ok(json!(request))
}

/// Approve or reject a pending request.
pub async fn decide_payout(state: &Arc<DaemonState>, params: &Value) -> Result {
    let DecideParams {
        request_id,
        decision,
        decided_by,
        notes,
    } = parse(params)?;
    let request = blocking(state, move |s| {
        Ok(s.payouts.decide(request_id, decision, &decided_by, notes.as_deref(), unix_now())?)
    })
    .await?;
    let event_type = match decision {
        Decision::Approve => "PayoutApproved",
        Decision::Reject => "PayoutRejected",
    };
    emit(state, event_type, &request);
    Ok(json!(request))
}

/// Hand an approved request to the payment gateway.
pub async fn dispatch_payout(state: &Arc<DaemonState>, params: &Value) -> Result {
    let RequestParams { request_id } = parse(params)?;
    let outcome = blocking(state, move |s| {
        Ok(s.payouts.dispatch(request_id, s.gateway.as_ref(), unix_now()))
    })
    .await?;
    match outcome {
        Ok(request) => {
            emit(state, "PayoutDispatched", &request);
            Ok(json!(request))
        }
        Err(err) => {
            note_failure(state, &err);
            Err(err.into())
        }
    }
}

/// Report the gateway's outcome for a processing request.
pub async fn settle_payout(state: &Arc<DaemonState>, params: &Value) -> Result {
    let SettleParams {
        request_id,
        outcome,
    } = parse(params)?;
    let settled = blocking(state, move |s| Ok(s.payouts.settle(request_id, outcome, unix_now()))).await?;
    match settled {
        Ok(result) => {
            if !result.replayed {
                let event_type = match result.request.status {
                    PayoutStatus::Completed => "PayoutCompleted",
                    PayoutStatus::Failed => "PayoutFailed",
                    _ => "PayoutRetrying",
                };
                emit(state, event_type, &result.request);
            }
            Ok(json!(result))
        }
        Err(err) => {
            note_failure(state, &err);
            Err(err.into())
        }
    }
}

/// Withdraw a pending request on the creator's behalf.
pub async fn cancel_payout(state: &Arc<DaemonState>, params: &Value) -> Result {
    let CancelParams {
        request_id,
        creator_id,
    } = parse(params)?;
    let request = blocking(state, move |s| {
        Ok(s.payouts.cancel(request_id, &creator_id, unix_now())?)
    })
    .await?;
    emit(state, "PayoutCancelled", &request);
    Ok(json!(request))
}

/// Fetch one request.
pub async fn get_payout(state: &Arc<DaemonState>, params: &Value) -> Result {
    let RequestParams { request_id } = parse(params)?;
    blocking(state, move |s| Ok(json!(s.payouts.get(request_id)?))).await
}

/// List a creator's requests, or every request in a status.
pub async fn list_payouts(state: &Arc<DaemonState>, params: &Value) -> Result {
    let ListParams { creator_id, status } = parse(params)?;
    blocking(state, move |s| {
        let requests = match (creator_id, status) {
            (Some(creator_id), status) => s
                .payouts
                .list_for_creator(&creator_id)?
                .into_iter()
                .filter(|r| status.map_or(true, |st| r.status == st))
                .collect::<Vec<_>>(),
            (None, Some(status)) => s.payouts.list_by_status(status)?,
            (None, None) => {
                return Err(RpcError::invalid_params("creator_id or status required"));
            }
        };
        Ok(json!({ "requests": requests }))
    })
    .await
}

/// Status history of a request.
pub async fn get_payout_audit(state: &Arc<DaemonState>, params: &Value) -> Result {
    let RequestParams { request_id } = parse(params)?;
    blocking(state, move |s| {
        let trail: Vec<Value> = s
            .payouts
            .audit_trail(request_id)?
            .iter()
            .map(|row| {
                json!({
                    "from_status": row.from_status,
                    "to_status": row.to_status,
                    "actor": row.actor,
                    "note": row.note,
                    "at": row.at,
                })
            })
            .collect();
        Ok(json!({ "request_id": request_id, "trail": trail }))
    })
    .await
}

/// Poll the gateway for requests stuck in processing.
pub async fn reconcile_stale_payouts(state: &Arc<DaemonState>) -> Result {
    let report = blocking(state, |s| {
        Ok(s.payouts.reconcile_stale(s.gateway.as_ref(), unix_now())?)
    })
    .await?;
    Ok(json!(report))
}
