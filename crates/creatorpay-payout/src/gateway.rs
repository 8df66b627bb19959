//! Payment collaborator interface.
//!
//! The engine never moves money itself. It hands a [`PaymentInstruction`]
//! to a [`PaymentGateway`] and later learns the outcome, either pushed in
//! through `settle` or pulled by polling [`PaymentGateway::status`].

use std::sync::Mutex;

use creatorpay_types::payout::PayoutMethod;
use creatorpay_types::{RequestId, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// How a failed transfer should be treated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Worth retrying later; the request returns to `pending`.
    Transient,
    /// Will never succeed; the request becomes `failed`.
    Permanent,
}

/// Final result of a transfer as reported by the payment collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SettlementOutcome {
    Success {
        #[serde(default)]
        external_reference: Option<String>,
    },
    Failure {
        class: FailureClass,
        reason: String,
    },
}

/// A transfer the collaborator should execute.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PaymentInstruction {
    pub request_id: RequestId,
    pub creator_id: UserId,
    pub method: PayoutMethod,
    /// Method-specific destination (account number, wallet, email, ...).
    pub destination: serde_json::Value,
    pub amount: Decimal,
    pub currency: String,
}

/// Error raised by a gateway call.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{class:?} gateway error: {reason}")]
pub struct GatewayError {
    pub class: FailureClass,
    pub reason: String,
}

impl GatewayError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Transient,
            reason: reason.into(),
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Permanent,
            reason: reason.into(),
        }
    }
}

/// External payment execution.
pub trait PaymentGateway: Send + Sync {
    /// Start a transfer and return the collaborator's reference for it.
    fn initiate(&self, instruction: &PaymentInstruction) -> Result<String, GatewayError>;

    /// Outcome of a transfer, or `None` while it is still in flight.
    fn status(&self, reference: &str) -> Result<Option<SettlementOutcome>, GatewayError>;
}

/// Gateway for operator-executed payouts.
///
/// Instructions are queued for a human to execute out of band; the outcome
/// is reported back through `settle`. Polling never resolves anything.
#[derive(Debug, Default)]
pub struct ManualGateway {
    queued: Mutex<Vec<PaymentInstruction>>,
}

impl ManualGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instructions handed over so far.
    pub fn queued(&self) -> Vec<PaymentInstruction> {
        self.queued.lock().map(|q| q.clone()).unwrap_or_default()
    }
}

impl PaymentGateway for ManualGateway {
    fn initiate(&self, instruction: &PaymentInstruction) -> Result<String, GatewayError> {
        let mut queued = self
            .queued
            .lock()
            .map_err(|_| GatewayError::transient("manual queue lock poisoned"))?;
        queued.push(instruction.clone());
        tracing::info!(
            request_id = instruction.request_id.0,
            creator = %instruction.creator_id,
            method = instruction.method.as_str(),
            amount = %instruction.amount,
            currency = %instruction.currency,
            "payout queued for manual execution"
        );
        Ok(format!("manual-{}", instruction.request_id))
    }

    fn status(&self, _reference: &str) -> Result<Option<SettlementOutcome>, GatewayError> {
        Ok(None)
    }
}
