//! Payout orchestrator.
//!
//! Every operation runs in one `BEGIN IMMEDIATE` transaction on the shared
//! connection, so the balance check and the write that depends on it see
//! the same ledger. Calls to the payment gateway happen outside any
//! transaction: `dispatch` commits `processing` first, then talks to the
//! gateway, then records the reference.
//!
//! Settlement is at-most-once. The withdrawal entry carries a UNIQUE link
//! to its request, and replaying a successful settlement returns the
//! existing entry.

use std::sync::MutexGuard;

use creatorpay_db::queries::{controls, entries, payouts};
use creatorpay_db::queries::payouts::AuditRow;
use creatorpay_db::{to_minor, txn, DbError, SharedConnection};
use creatorpay_ledger::balance::{balance_in, compute_in};
use creatorpay_ledger::store::append_in;
use creatorpay_types::ledger::EntryDraft;
use creatorpay_types::money::is_minor_exact;
use creatorpay_types::payout::{PayoutMethod, PayoutRequest, PayoutStatus};
use creatorpay_types::{EntryId, RequestId, UserId, DEFAULT_CURRENCY};
use rusqlite::Connection;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::gateway::{FailureClass, PaymentGateway, PaymentInstruction, SettlementOutcome};
use crate::state::{transition, Action};
use crate::{PayoutError, Result};

/// Default minimum payout ($10.00).
pub const DEFAULT_MIN_PAYOUT: Decimal = Decimal::from_parts(1000, 0, 0, false, 2);

/// Default time a request may sit in `processing` before it is polled.
pub const DEFAULT_PROCESSING_TIMEOUT_SECS: u64 = 3_600;

/// Audit actor for gateway-driven transitions.
const GATEWAY_ACTOR: &str = "gateway";

/// Audit actor for engine-driven transitions.
const SYSTEM_ACTOR: &str = "system";

/// Business limits applied to payouts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PayoutPolicy {
    pub min_payout: Decimal,
    pub currency: String,
    pub processing_timeout_secs: u64,
}

impl Default for PayoutPolicy {
    fn default() -> Self {
        Self {
            min_payout: DEFAULT_MIN_PAYOUT,
            currency: DEFAULT_CURRENCY.to_string(),
            processing_timeout_secs: DEFAULT_PROCESSING_TIMEOUT_SECS,
        }
    }
}

/// An admin's verdict on a pending request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

/// Outcome of [`PayoutOrchestrator::settle`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SettlementResult {
    pub request: PayoutRequest,
    /// The withdrawal entry, for successful settlements.
    pub withdrawal_entry: Option<EntryId>,
    /// `true` if the request was already completed and nothing changed.
    pub replayed: bool,
}

/// Outcome of [`PayoutOrchestrator::reconcile_stale`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StaleReport {
    pub examined: usize,
    pub settled: Vec<RequestId>,
    pub in_flight: Vec<RequestId>,
}

/// Drives payout requests through their lifecycle.
#[derive(Clone, Debug)]
pub struct PayoutOrchestrator {
    conn: SharedConnection,
    policy: PayoutPolicy,
}

impl PayoutOrchestrator {
    /// # Errors
    ///
    /// - [`PayoutError::Validation`] if the policy's minimum is not a
    ///   positive whole-cent amount
    pub fn new(conn: SharedConnection, policy: PayoutPolicy) -> Result<Self> {
        if policy.min_payout <= Decimal::ZERO || !is_minor_exact(policy.min_payout) {
            return Err(PayoutError::Validation(format!(
                "minimum payout {} must be a positive whole-cent amount",
                policy.min_payout
            )));
        }
        Ok(Self { conn, policy })
    }

    pub fn policy(&self) -> &PayoutPolicy {
        &self.policy
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| PayoutError::LockPoisoned)
    }

    /// Open a payout request for `amount`.
    ///
    /// # Errors
    ///
    /// - [`PayoutError::Validation`] for non-positive or sub-cent amounts
    /// - [`PayoutError::BelowMinimum`] under the policy minimum
    /// - [`PayoutError::CreatorFrozen`] if payouts are halted for the creator
    /// - [`PayoutError::ActiveRequestExists`] if one is already open,
    ///   whatever the balance
    /// - [`PayoutError::InsufficientBalance`] if `amount` exceeds the
    ///   available balance
    pub fn submit(
        &self,
        creator_id: &UserId,
        amount: Decimal,
        method: PayoutMethod,
        method_details: serde_json::Value,
        now: u64,
    ) -> Result<PayoutRequest> {
        if amount <= Decimal::ZERO || !is_minor_exact(amount) {
            return Err(PayoutError::Validation(format!(
                "payout amount {amount} must be a positive whole-cent amount"
            )));
        }
        if amount < self.policy.min_payout {
            return Err(PayoutError::BelowMinimum {
                requested: amount,
                minimum: self.policy.min_payout,
            });
        }

        let mut conn = self.lock()?;
        let request = txn::immediate(&mut conn, |tx| {
            ensure_not_frozen(tx, creator_id)?;
            if payouts::active_for_creator(tx, creator_id)?.is_some() {
                return Err(PayoutError::ActiveRequestExists {
                    creator_id: creator_id.clone(),
                });
            }
            let available = balance_in(tx, creator_id, now)?.available;
            if amount > available {
                return Err(PayoutError::InsufficientBalance {
                    requested: amount,
                    available,
                });
            }

            let id = payouts::insert(tx, creator_id, amount, method, &method_details, now)
                .map_err(|e| match e {
                    DbError::Constraint(_) => PayoutError::ActiveRequestExists {
                        creator_id: creator_id.clone(),
                    },
                    other => other.into(),
                })?;
            audit(tx, id, None, PayoutStatus::Pending, creator_id.as_str(), None, now)?;
            Ok(payouts::get(tx, id)?)
        })?;

        tracing::info!(
            request_id = request.id.0,
            creator = %creator_id,
            amount = %amount,
            method = method.as_str(),
            "payout requested"
        );
        Ok(request)
    }

    /// Approve or reject a pending request.
    ///
    /// # Errors
    ///
    /// - [`PayoutError::Validation`] when rejecting without notes
    /// - [`PayoutError::InvalidTransition`] unless the request is `pending`
    /// - [`PayoutError::StaleBalance`] if approval finds the balance short
    /// - [`PayoutError::CreatorFrozen`] when approving for a frozen creator
    pub fn decide(
        &self,
        request_id: RequestId,
        decision: Decision,
        decided_by: &UserId,
        notes: Option<&str>,
        now: u64,
    ) -> Result<PayoutRequest> {
        let notes = notes.map(str::trim).filter(|n| !n.is_empty());
        let action = match decision {
            Decision::Approve => Action::Approve,
            Decision::Reject => Action::Reject,
        };
        if decision == Decision::Reject && notes.is_none() {
            return Err(PayoutError::Validation(
                "rejecting a payout requires notes".to_string(),
            ));
        }

        let mut conn = self.lock()?;
        let request = txn::immediate(&mut conn, |tx| {
            let request = payouts::get(tx, request_id)?;
            let to = transition(request.status, action)?;

            if decision == Decision::Approve {
                ensure_not_frozen(tx, &request.creator_id)?;
                let balance = balance_in(tx, &request.creator_id, now)?;
                if request.requested_amount > balance.available {
                    return Err(PayoutError::StaleBalance {
                        requested: request.requested_amount,
                        available: balance.available,
                    });
                }
            }

            payouts::transition(tx, request_id, request.status, to, now)?;
            payouts::record_decision(tx, request_id, decided_by, now)?;
            if let Some(note) = notes {
                payouts::append_note(tx, request_id, note)?;
            }
            audit(tx, request_id, Some(request.status), to, decided_by.as_str(), notes, now)?;
            Ok(payouts::get(tx, request_id)?)
        })?;

        tracing::info!(
            request_id = request_id.0,
            creator = %request.creator_id,
            decision = ?decision,
            decided_by = %decided_by,
            "payout decided"
        );
        Ok(request)
    }

    /// Move an approved request to `processing` and hand it to the gateway.
    ///
    /// # Errors
    ///
    /// - [`PayoutError::InvalidTransition`] unless the request is `approved`
    /// - [`PayoutError::ExternalSettlementFailure`] if the gateway refused
    ///   the transfer; the failure has already been settled with the
    ///   gateway's class
    pub fn dispatch(
        &self,
        request_id: RequestId,
        gateway: &dyn PaymentGateway,
        now: u64,
    ) -> Result<PayoutRequest> {
        let instruction = {
            let mut conn = self.lock()?;
            txn::immediate(&mut conn, |tx| {
                let request = payouts::get(tx, request_id)?;
                let to = transition(request.status, Action::Dispatch)?;
                ensure_not_frozen(tx, &request.creator_id)?;
                payouts::transition(tx, request_id, request.status, to, now)?;
                payouts::begin_processing(tx, request_id, now)?;
                audit(tx, request_id, Some(request.status), to, SYSTEM_ACTOR, None, now)?;
                Ok::<_, PayoutError>(PaymentInstruction {
                    request_id,
                    creator_id: request.creator_id,
                    method: request.method,
                    destination: request.method_details,
                    amount: request.requested_amount,
                    currency: self.policy.currency.clone(),
                })
            })?
        };

        match gateway.initiate(&instruction) {
            Ok(reference) => {
                let mut conn = self.lock()?;
                let request = txn::immediate(&mut conn, |tx| {
                    payouts::set_external_reference(tx, request_id, &reference)?;
                    payouts::append_note(tx, request_id, &format!("dispatched as {reference}"))?;
                    Ok::<_, PayoutError>(payouts::get(tx, request_id)?)
                })?;
                tracing::info!(
                    request_id = request_id.0,
                    creator = %instruction.creator_id,
                    amount = %instruction.amount,
                    reference = %reference,
                    "payout dispatched"
                );
                Ok(request)
            }
            Err(err) => {
                tracing::warn!(
                    request_id = request_id.0,
                    class = ?err.class,
                    reason = %err.reason,
                    "gateway refused payout"
                );
                self.settle(
                    request_id,
                    SettlementOutcome::Failure {
                        class: err.class,
                        reason: err.reason.clone(),
                    },
                    now,
                )?;
                Err(PayoutError::ExternalSettlementFailure {
                    class: err.class,
                    reason: err.reason,
                })
            }
        }
    }

    /// Apply the payment collaborator's outcome to a processing request.
    ///
    /// Success completes the request and appends the paid withdrawal entry
    /// in the same transaction. Replaying success on a completed request
    /// returns the existing result.
    ///
    /// # Errors
    ///
    /// - [`PayoutError::InvalidTransition`] unless the request is
    ///   `processing` (or `completed` for a success replay)
    /// - [`PayoutError::LedgerInconsistency`] if the ledger cannot cover the
    ///   payout; the creator is frozen
    pub fn settle(
        &self,
        request_id: RequestId,
        outcome: SettlementOutcome,
        now: u64,
    ) -> Result<SettlementResult> {
        let mut conn = self.lock()?;
        let result = txn::immediate(&mut conn, |tx| settle_in(tx, request_id, &outcome, now));

        match result {
            Ok(settled) => {
                log_settlement(&settled, &outcome);
                Ok(settled)
            }
            Err(PayoutError::LedgerInconsistency { creator_id, detail }) => {
                freeze_creator(&mut conn, &creator_id, &detail, now)?;
                Err(PayoutError::LedgerInconsistency { creator_id, detail })
            }
            Err(e) => Err(e),
        }
    }

    /// Withdraw a pending request. Only its creator may cancel it.
    pub fn cancel(&self, request_id: RequestId, creator_id: &UserId, now: u64) -> Result<PayoutRequest> {
        let mut conn = self.lock()?;
        let request = txn::immediate(&mut conn, |tx| {
            let request = payouts::get(tx, request_id)?;
            if request.creator_id != *creator_id {
                return Err(PayoutError::NotFound(format!(
                    "payout request {request_id} of {creator_id}"
                )));
            }
            let to = transition(request.status, Action::Cancel)?;
            payouts::transition(tx, request_id, request.status, to, now)?;
            audit(tx, request_id, Some(request.status), to, creator_id.as_str(), None, now)?;
            Ok(payouts::get(tx, request_id)?)
        })?;
        tracing::info!(request_id = request_id.0, creator = %creator_id, "payout cancelled");
        Ok(request)
    }

    /// Poll the gateway for requests stuck in `processing` past the timeout.
    ///
    /// Confirmed outcomes are settled; anything the gateway cannot confirm
    /// is left in place and reported as in flight.
    pub fn reconcile_stale(&self, gateway: &dyn PaymentGateway, now: u64) -> Result<StaleReport> {
        let cutoff = now.saturating_sub(self.policy.processing_timeout_secs);
        let stale = {
            let conn = self.lock()?;
            payouts::processing_since_before(&conn, cutoff)?
        };

        let mut report = StaleReport::default();
        for request in stale {
            report.examined += 1;
            let Some(reference) = request.external_reference.as_deref() else {
                tracing::warn!(
                    request_id = request.id.0,
                    processing_since = ?request.processing_since,
                    "stale payout has no gateway reference, leaving for an operator"
                );
                report.in_flight.push(request.id);
                continue;
            };

            match gateway.status(reference) {
                Ok(Some(outcome)) => match self.settle(request.id, outcome, now) {
                    Ok(_) => report.settled.push(request.id),
                    Err(e) => {
                        tracing::warn!(request_id = request.id.0, error = %e, "stale payout settlement failed");
                        report.in_flight.push(request.id);
                    }
                },
                Ok(None) => {
                    tracing::info!(request_id = request.id.0, reference, "payout still in flight");
                    report.in_flight.push(request.id);
                }
                Err(e) => {
                    tracing::warn!(request_id = request.id.0, reference, error = %e, "gateway status check failed");
                    report.in_flight.push(request.id);
                }
            }
        }

        if report.examined > 0 {
            tracing::info!(
                examined = report.examined,
                settled = report.settled.len(),
                in_flight = report.in_flight.len(),
                "stale payouts reconciled"
            );
        }
        Ok(report)
    }

    pub fn get(&self, request_id: RequestId) -> Result<PayoutRequest> {
        let conn = self.lock()?;
        Ok(payouts::get(&conn, request_id)?)
    }

    /// A creator's requests, newest first.
    pub fn list_for_creator(&self, creator_id: &UserId) -> Result<Vec<PayoutRequest>> {
        let conn = self.lock()?;
        Ok(payouts::list_for_creator(&conn, creator_id)?)
    }

    /// Requests in a status, oldest first.
    pub fn list_by_status(&self, status: PayoutStatus) -> Result<Vec<PayoutRequest>> {
        let conn = self.lock()?;
        Ok(payouts::list_by_status(&conn, status)?)
    }

    /// Every status change of a request, oldest first.
    pub fn audit_trail(&self, request_id: RequestId) -> Result<Vec<AuditRow>> {
        let conn = self.lock()?;
        payouts::get(&conn, request_id)?;
        Ok(payouts::audit_trail(&conn, request_id)?)
    }
}

fn settle_in(
    tx: &Connection,
    request_id: RequestId,
    outcome: &SettlementOutcome,
    now: u64,
) -> Result<SettlementResult> {
    let request = payouts::get(tx, request_id)?;

    if request.status == PayoutStatus::Completed {
        if let SettlementOutcome::Success { .. } = outcome {
            let entry = entries::withdrawal_for_request(tx, request_id)?.ok_or_else(|| {
                PayoutError::LedgerInconsistency {
                    creator_id: request.creator_id.clone(),
                    detail: format!("completed payout {request_id} has no withdrawal entry"),
                }
            })?;
            return Ok(SettlementResult {
                request,
                withdrawal_entry: Some(entry.id),
                replayed: true,
            });
        }
    }

    let action = match outcome {
        SettlementOutcome::Success { .. } => Action::SettleSuccess,
        SettlementOutcome::Failure {
            class: FailureClass::Transient,
            ..
        } => Action::SettleTransientFailure,
        SettlementOutcome::Failure {
            class: FailureClass::Permanent,
            ..
        } => Action::SettlePermanentFailure,
    };
    let to = transition(request.status, action)?;
    payouts::transition(tx, request_id, request.status, to, now)?;
    payouts::end_processing(tx, request_id)?;

    match outcome {
        SettlementOutcome::Success { external_reference } => {
            if let Some(reference) = external_reference {
                payouts::set_external_reference(tx, request_id, reference)?;
            }
            let creator_id = &request.creator_id;
            let inconsistent = |detail: String| PayoutError::LedgerInconsistency {
                creator_id: creator_id.clone(),
                detail,
            };

            if entries::withdrawal_for_request(tx, request_id)?.is_some() {
                return Err(inconsistent(format!(
                    "payout {request_id} already has a withdrawal entry"
                )));
            }
            let balance = compute_in(tx, creator_id)?;
            if request.requested_amount > balance.available {
                return Err(inconsistent(format!(
                    "payout {request_id} of {} exceeds available {}",
                    request.requested_amount, balance.available
                )));
            }

            let entry_id = append_in(
                tx,
                &EntryDraft::withdrawal(creator_id.clone(), request.requested_amount, request_id, now),
            )?;
            let paid_minor = entries::paid_withdrawals_minor(tx, creator_id)?;
            let flipped = entries::mark_paid_through(tx, creator_id, paid_minor)?;
            tracing::debug!(request_id = request_id.0, flipped, "earnings marked paid");

            audit(
                tx,
                request_id,
                Some(request.status),
                to,
                GATEWAY_ACTOR,
                external_reference.as_deref(),
                now,
            )?;
            Ok(SettlementResult {
                request: payouts::get(tx, request_id)?,
                withdrawal_entry: Some(entry_id),
                replayed: false,
            })
        }
        SettlementOutcome::Failure { class, reason } => {
            let note = format!("{} failure: {reason}", class_name(*class));
            payouts::append_note(tx, request_id, &note)?;
            audit(tx, request_id, Some(request.status), to, GATEWAY_ACTOR, Some(&note), now)?;
            Ok(SettlementResult {
                request: payouts::get(tx, request_id)?,
                withdrawal_entry: None,
                replayed: false,
            })
        }
    }
}

fn class_name(class: FailureClass) -> &'static str {
    match class {
        FailureClass::Transient => "transient",
        FailureClass::Permanent => "permanent",
    }
}

fn ensure_not_frozen(tx: &Connection, creator_id: &UserId) -> Result<()> {
    match controls::frozen_reason(tx, creator_id)? {
        Some(reason) => Err(PayoutError::CreatorFrozen {
            creator_id: creator_id.clone(),
            reason,
        }),
        None => Ok(()),
    }
}

fn audit(
    tx: &Connection,
    request_id: RequestId,
    from: Option<PayoutStatus>,
    to: PayoutStatus,
    actor: &str,
    note: Option<&str>,
    now: u64,
) -> Result<()> {
    payouts::insert_audit(
        tx,
        &AuditRow {
            request_id,
            from_status: from,
            to_status: to,
            actor: actor.to_string(),
            note: note.map(str::to_string),
            at: now,
        },
    )?;
    Ok(())
}

fn freeze_creator(conn: &mut Connection, creator_id: &UserId, detail: &str, now: u64) -> Result<()> {
    txn::immediate(conn, |tx| {
        controls::insert_anomaly(
            tx,
            &controls::AnomalyRow {
                creator_id: creator_id.clone(),
                kind: "payout_mismatch".to_string(),
                detail: detail.to_string(),
                amount_minor: to_minor(Decimal::ZERO)?,
                at: now,
            },
        )?;
        controls::freeze(tx, creator_id, detail, now)?;
        Ok::<_, PayoutError>(())
    })?;
    tracing::error!(creator = %creator_id, detail, "payout ledger inconsistency, creator frozen");
    Ok(())
}

fn log_settlement(settled: &SettlementResult, outcome: &SettlementOutcome) {
    let request = &settled.request;
    if settled.replayed {
        tracing::info!(request_id = request.id.0, "settlement replay ignored");
        return;
    }
    match outcome {
        SettlementOutcome::Success { .. } => tracing::info!(
            request_id = request.id.0,
            creator = %request.creator_id,
            amount = %request.requested_amount,
            entry_id = ?settled.withdrawal_entry.map(|e| e.0),
            "payout completed"
        ),
        SettlementOutcome::Failure { class, reason } => tracing::warn!(
            request_id = request.id.0,
            creator = %request.creator_id,
            class = class_name(*class),
            reason = %reason,
            status = request.status.as_str(),
            "payout settlement failed"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{GatewayError, ManualGateway};
    use creatorpay_ledger::{BalanceCalculator, LedgerStore};
    use creatorpay_types::ledger::{EntryStatus, RevenueSource};
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct Harness {
        conn: SharedConnection,
        store: LedgerStore,
        balances: BalanceCalculator,
        payouts: PayoutOrchestrator,
    }

    fn harness() -> Harness {
        let conn = creatorpay_db::shared(creatorpay_db::open_memory().expect("open"));
        Harness {
            store: LedgerStore::new(conn.clone()),
            balances: BalanceCalculator::new(conn.clone()),
            payouts: PayoutOrchestrator::new(conn.clone(), PayoutPolicy::default()).expect("policy"),
            conn,
        }
    }

    fn credit(h: &Harness, creator: &UserId, amount: Decimal, at: u64) -> EntryId {
        h.store
            .append(
                &EntryDraft::earning(creator.clone(), RevenueSource::Tip, amount, dec!(0), at)
                    .expect("draft"),
            )
            .expect("credit")
    }

    fn submit(h: &Harness, creator: &UserId, amount: Decimal) -> Result<PayoutRequest> {
        h.payouts.submit(
            creator,
            amount,
            PayoutMethod::BankTransfer,
            serde_json::json!({"iban": "DE00 0000"}),
            100,
        )
    }

    fn approve(h: &Harness, id: RequestId) -> PayoutRequest {
        h.payouts
            .decide(id, Decision::Approve, &UserId::from("admin"), None, 200)
            .expect("approve")
    }

    /// Gateway that accepts everything and reports scripted outcomes.
    #[derive(Default)]
    struct ScriptedGateway {
        refuse: Option<GatewayError>,
        outcomes: Mutex<HashMap<String, SettlementOutcome>>,
    }

    impl PaymentGateway for ScriptedGateway {
        fn initiate(&self, instruction: &PaymentInstruction) -> std::result::Result<String, GatewayError> {
            match &self.refuse {
                Some(err) => Err(err.clone()),
                None => Ok(format!("tx-{}", instruction.request_id)),
            }
        }

        fn status(&self, reference: &str) -> std::result::Result<Option<SettlementOutcome>, GatewayError> {
            Ok(self.outcomes.lock().expect("lock").get(reference).cloned())
        }
    }

    #[test]
    fn test_submit_checks() {
        let h = harness();
        let creator = UserId::from("c1");
        credit(&h, &creator, dec!(12.50), 1);

        assert!(matches!(submit(&h, &creator, dec!(0)), Err(PayoutError::Validation(_))));
        assert!(matches!(submit(&h, &creator, dec!(10.001)), Err(PayoutError::Validation(_))));
        assert!(matches!(submit(&h, &creator, dec!(9.99)), Err(PayoutError::BelowMinimum { .. })));
        assert!(matches!(
            submit(&h, &creator, dec!(20)),
            Err(PayoutError::InsufficientBalance { .. })
        ));

        let request = submit(&h, &creator, dec!(10)).expect("submit");
        assert_eq!(request.status, PayoutStatus::Pending);

        let rich = UserId::from("c2");
        credit(&h, &rich, dec!(100), 1);
        submit(&h, &rich, dec!(10)).expect("submit");
        assert!(matches!(
            submit(&h, &rich, dec!(10)),
            Err(PayoutError::ActiveRequestExists { .. })
        ));
    }

    #[test]
    fn test_open_request_conflicts_even_when_balance_is_short() {
        let h = harness();
        let creator = UserId::from("c1");
        credit(&h, &creator, dec!(12.50), 1);
        let first = submit(&h, &creator, dec!(10)).expect("submit");

        let blocked = |h: &Harness| {
            for amount in [dec!(10), dec!(50)] {
                assert!(matches!(
                    submit(h, &creator, amount),
                    Err(PayoutError::ActiveRequestExists { ref creator_id }) if *creator_id == creator
                ));
            }
        };

        blocked(&h);
        approve(&h, first.id);
        blocked(&h);
        let dispatched = h.payouts.dispatch(first.id, &ManualGateway::new(), 300).expect("dispatch");
        assert_eq!(dispatched.status, PayoutStatus::Processing);
        blocked(&h);
    }

    #[test]
    fn test_frozen_creator_cannot_submit() {
        let h = harness();
        let creator = UserId::from("c1");
        credit(&h, &creator, dec!(50), 1);
        {
            let conn = h.conn.lock().expect("lock");
            controls::freeze(&conn, &creator, "manual hold", 5).expect("freeze");
        }
        assert!(matches!(submit(&h, &creator, dec!(20)), Err(PayoutError::CreatorFrozen { .. })));
    }

    #[test]
    fn test_full_lifecycle() {
        let h = harness();
        let creator = UserId::from("c1");
        let older = credit(&h, &creator, dec!(20), 1);
        let newer = credit(&h, &creator, dec!(10), 2);

        let request = submit(&h, &creator, dec!(20)).expect("submit");
        approve(&h, request.id);
        let gateway = ManualGateway::new();
        let dispatched = h.payouts.dispatch(request.id, &gateway, 300).expect("dispatch");
        assert_eq!(dispatched.status, PayoutStatus::Processing);
        assert_eq!(dispatched.external_reference.as_deref(), Some("manual-1"));
        assert_eq!(dispatched.attempts, 1);
        assert_eq!(gateway.queued()[0].amount, dec!(20));

        let settled = h
            .payouts
            .settle(request.id, SettlementOutcome::Success { external_reference: None }, 400)
            .expect("settle");
        assert!(!settled.replayed);
        assert_eq!(settled.request.status, PayoutStatus::Completed);

        let balance = h.balances.get_balance(&creator, 1_000).expect("balance");
        assert_eq!(balance.total_earnings, dec!(30));
        assert_eq!(balance.total_payouts, dec!(20));
        assert_eq!(balance.available, dec!(10));

        let withdrawal = h.store.get(settled.withdrawal_entry.expect("entry")).expect("entry");
        assert_eq!(withdrawal.net_amount, dec!(-20));
        assert_eq!(withdrawal.payout_request_id, Some(request.id));
        assert_eq!(h.store.get(older).expect("entry").status, EntryStatus::Paid);
        assert_eq!(h.store.get(newer).expect("entry").status, EntryStatus::Pending);

        let trail: Vec<(Option<PayoutStatus>, PayoutStatus)> = h
            .payouts
            .audit_trail(request.id)
            .expect("trail")
            .into_iter()
            .map(|row| (row.from_status, row.to_status))
            .collect();
        assert_eq!(
            trail,
            vec![
                (None, PayoutStatus::Pending),
                (Some(PayoutStatus::Pending), PayoutStatus::Approved),
                (Some(PayoutStatus::Approved), PayoutStatus::Processing),
                (Some(PayoutStatus::Processing), PayoutStatus::Completed),
            ]
        );
    }

    #[test]
    fn test_settle_success_is_idempotent() {
        let h = harness();
        let creator = UserId::from("c1");
        credit(&h, &creator, dec!(40), 1);
        let request = submit(&h, &creator, dec!(25)).expect("submit");
        approve(&h, request.id);
        h.payouts.dispatch(request.id, &ManualGateway::new(), 300).expect("dispatch");

        let success = SettlementOutcome::Success {
            external_reference: Some("bank-77".to_string()),
        };
        let first = h.payouts.settle(request.id, success.clone(), 400).expect("settle");
        let second = h.payouts.settle(request.id, success, 500).expect("replay");
        assert!(second.replayed);
        assert_eq!(first.withdrawal_entry, second.withdrawal_entry);
        assert_eq!(second.request.external_reference.as_deref(), Some("bank-77"));
        assert_eq!(h.balances.get_balance(&creator, 1_000).expect("balance").available, dec!(15));

        let late_failure = SettlementOutcome::Failure {
            class: FailureClass::Permanent,
            reason: "late".to_string(),
        };
        assert!(matches!(
            h.payouts.settle(request.id, late_failure, 600),
            Err(PayoutError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_transient_then_permanent_failure() {
        let h = harness();
        let creator = UserId::from("c1");
        credit(&h, &creator, dec!(60), 1);
        let request = submit(&h, &creator, dec!(50)).expect("submit");
        approve(&h, request.id);
        h.payouts.dispatch(request.id, &ManualGateway::new(), 300).expect("dispatch");

        let retry = h
            .payouts
            .settle(
                request.id,
                SettlementOutcome::Failure {
                    class: FailureClass::Transient,
                    reason: "gateway timeout".to_string(),
                },
                400,
            )
            .expect("transient");
        assert_eq!(retry.request.status, PayoutStatus::Pending);
        assert_eq!(retry.request.processing_since, None);
        assert_eq!(h.balances.get_balance(&creator, 1_000).expect("balance").available, dec!(60));

        approve(&h, request.id);
        h.payouts.dispatch(request.id, &ManualGateway::new(), 500).expect("dispatch");
        let failed = h
            .payouts
            .settle(
                request.id,
                SettlementOutcome::Failure {
                    class: FailureClass::Permanent,
                    reason: "account closed".to_string(),
                },
                600,
            )
            .expect("permanent");
        assert_eq!(failed.request.status, PayoutStatus::Failed);
        assert_eq!(failed.request.attempts, 2);
        assert!(failed
            .request
            .notes
            .as_deref()
            .is_some_and(|n| n.contains("permanent failure: account closed")));
        assert_eq!(h.balances.get_balance(&creator, 1_000).expect("balance").available, dec!(60));

        let last = h.payouts.audit_trail(request.id).expect("trail").pop().expect("row");
        assert_eq!(last.to_status, PayoutStatus::Failed);
        assert_eq!(last.note.as_deref(), Some("permanent failure: account closed"));

        // A failed request no longer blocks a new one.
        assert!(submit(&h, &creator, dec!(50)).is_ok());
    }

    #[test]
    fn test_reject_requires_notes() {
        let h = harness();
        let creator = UserId::from("c1");
        credit(&h, &creator, dec!(30), 1);
        let request = submit(&h, &creator, dec!(30)).expect("submit");
        let admin = UserId::from("admin");

        assert!(matches!(
            h.payouts.decide(request.id, Decision::Reject, &admin, Some("  "), 200),
            Err(PayoutError::Validation(_))
        ));
        let rejected = h
            .payouts
            .decide(request.id, Decision::Reject, &admin, Some("suspicious activity"), 200)
            .expect("reject");
        assert_eq!(rejected.status, PayoutStatus::Rejected);
        assert_eq!(rejected.decided_by, Some(admin.clone()));
        assert_eq!(rejected.decided_at, Some(200));
        assert!(matches!(
            h.payouts.decide(request.id, Decision::Approve, &admin, None, 300),
            Err(PayoutError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_approve_detects_stale_balance() {
        let h = harness();
        let creator = UserId::from("c1");
        credit(&h, &creator, dec!(15), 1);
        let request = submit(&h, &creator, dec!(12)).expect("submit");

        // A payout settled out of band lands in the ledger after submission.
        {
            let conn = h.conn.lock().expect("lock");
            conn.execute(
                "INSERT INTO payout_requests
                    (creator_id, requested_minor, method, method_details, status, created_at, updated_at)
                 VALUES ('c1', 500, 'paypal', '{}', 'completed', 150, 150)",
                [],
            )
            .expect("request row");
            let out_of_band = RequestId(conn.last_insert_rowid());
            append_in(&conn, &EntryDraft::withdrawal(creator.clone(), dec!(5), out_of_band, 150))
                .expect("withdrawal");
        }

        assert!(matches!(
            h.payouts.decide(request.id, Decision::Approve, &UserId::from("admin"), None, 200),
            Err(PayoutError::StaleBalance { .. })
        ));
        assert_eq!(h.payouts.get(request.id).expect("get").status, PayoutStatus::Pending);
    }

    #[test]
    fn test_cancel_only_by_owner_while_pending() {
        let h = harness();
        let creator = UserId::from("c1");
        credit(&h, &creator, dec!(30), 1);
        let request = submit(&h, &creator, dec!(30)).expect("submit");

        assert!(matches!(
            h.payouts.cancel(request.id, &UserId::from("intruder"), 150),
            Err(PayoutError::NotFound(_))
        ));
        let cancelled = h.payouts.cancel(request.id, &creator, 150).expect("cancel");
        assert_eq!(cancelled.status, PayoutStatus::Cancelled);
        assert!(matches!(
            h.payouts.cancel(request.id, &creator, 160),
            Err(PayoutError::InvalidTransition { .. })
        ));
        assert_eq!(h.balances.get_balance(&creator, 1_000).expect("balance").available, dec!(30));
    }

    #[test]
    fn test_gateway_refusal_settles_failure() {
        let h = harness();
        let creator = UserId::from("c1");
        credit(&h, &creator, dec!(30), 1);
        let request = submit(&h, &creator, dec!(30)).expect("submit");
        approve(&h, request.id);

        let gateway = ScriptedGateway {
            refuse: Some(GatewayError::permanent("invalid iban")),
            ..Default::default()
        };
        assert!(matches!(
            h.payouts.dispatch(request.id, &gateway, 300),
            Err(PayoutError::ExternalSettlementFailure {
                class: FailureClass::Permanent,
                ..
            })
        ));
        assert_eq!(h.payouts.get(request.id).expect("get").status, PayoutStatus::Failed);
    }

    #[test]
    fn test_reconcile_stale_polls_gateway() {
        let h = harness();
        let settled_creator = UserId::from("c1");
        let waiting_creator = UserId::from("c2");
        credit(&h, &settled_creator, dec!(30), 1);
        credit(&h, &waiting_creator, dec!(30), 1);

        let gateway = ScriptedGateway::default();
        let mut ids = Vec::new();
        for creator in [&settled_creator, &waiting_creator] {
            let request = submit(&h, creator, dec!(20)).expect("submit");
            approve(&h, request.id);
            h.payouts.dispatch(request.id, &gateway, 1_000).expect("dispatch");
            ids.push(request.id);
        }
        gateway.outcomes.lock().expect("lock").insert(
            format!("tx-{}", ids[0]),
            SettlementOutcome::Success { external_reference: None },
        );

        let early = h.payouts.reconcile_stale(&gateway, 1_000 + 60).expect("reconcile");
        assert_eq!(early.examined, 0);

        let report = h
            .payouts
            .reconcile_stale(&gateway, 1_000 + DEFAULT_PROCESSING_TIMEOUT_SECS)
            .expect("reconcile");
        assert_eq!(report.examined, 2);
        assert_eq!(report.settled, vec![ids[0]]);
        assert_eq!(report.in_flight, vec![ids[1]]);
        assert_eq!(h.payouts.get(ids[0]).expect("get").status, PayoutStatus::Completed);
        assert_eq!(h.payouts.get(ids[1]).expect("get").status, PayoutStatus::Processing);
    }
}
