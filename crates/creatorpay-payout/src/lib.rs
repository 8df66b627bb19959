//! # creatorpay-payout
//!
//! Payout request lifecycle: submission, admin decision, dispatch to the
//! payment collaborator, settlement and stale-request reconciliation.
//!
//! ## Modules
//!
//! - [`state`]: Pure status transition table
//! - [`gateway`]: Payment collaborator trait and instructions
//! - [`orchestrator`]: Transactional lifecycle operations

pub mod gateway;
pub mod orchestrator;
pub mod state;

pub use gateway::{
    FailureClass, GatewayError, ManualGateway, PaymentGateway, PaymentInstruction,
    SettlementOutcome,
};
pub use orchestrator::{Decision, PayoutOrchestrator, PayoutPolicy, SettlementResult, StaleReport};
pub use state::{transition, Action};

use creatorpay_db::txn::TxError;
use creatorpay_db::DbError;
use creatorpay_ledger::LedgerError;
use creatorpay_types::payout::PayoutStatus;
use creatorpay_types::UserId;
use rust_decimal::Decimal;

/// Error types for payout operations.
#[derive(Debug, thiserror::Error)]
pub enum PayoutError {
    /// Malformed input.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The request exceeds the creator's available balance.
    #[error("insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance {
        requested: Decimal,
        available: Decimal,
    },

    /// The request is under the configured minimum payout.
    #[error("payout {requested} is below the minimum of {minimum}")]
    BelowMinimum { requested: Decimal, minimum: Decimal },

    /// The balance dropped below the requested amount after submission.
    #[error("balance changed since submission: requested {requested}, available {available}")]
    StaleBalance {
        requested: Decimal,
        available: Decimal,
    },

    /// The creator already has a pending, approved or processing request.
    #[error("creator {creator_id} already has an active payout request")]
    ActiveRequestExists { creator_id: UserId },

    /// Another writer kept the database locked.
    #[error("concurrency conflict after {attempts} attempts")]
    ConcurrencyConflict { attempts: u32 },

    /// The payment collaborator rejected or failed the transfer.
    #[error("external settlement failed ({class:?}): {reason}")]
    ExternalSettlementFailure { class: FailureClass, reason: String },

    /// Ledger and payout state disagree. The creator has been frozen.
    #[error("ledger inconsistency for {creator_id}: {detail}")]
    LedgerInconsistency { creator_id: UserId, detail: String },

    /// Payouts are halted for the creator.
    #[error("creator {creator_id} is frozen: {reason}")]
    CreatorFrozen { creator_id: UserId, reason: String },

    /// The action is not allowed from the request's current status.
    #[error("cannot {action:?} a payout request in status {}", .from.as_str())]
    InvalidTransition { from: PayoutStatus, action: Action },

    /// Unknown payout request.
    #[error("not found: {0}")]
    NotFound(String),

    /// The shared connection lock was poisoned by a panicking holder.
    #[error("database connection lock poisoned")]
    LockPoisoned,

    /// Ledger failure not covered above.
    #[error(transparent)]
    Ledger(LedgerError),

    /// Storage failure.
    #[error("database error: {0}")]
    Db(DbError),
}

impl From<DbError> for PayoutError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(what) => PayoutError::NotFound(what),
            other => PayoutError::Db(other),
        }
    }
}

impl From<rusqlite::Error> for PayoutError {
    fn from(err: rusqlite::Error) -> Self {
        PayoutError::Db(DbError::Sqlite(err))
    }
}

impl From<LedgerError> for PayoutError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Validation(msg) => PayoutError::Validation(msg),
            LedgerError::LedgerInconsistency { creator_id, detail } => {
                PayoutError::LedgerInconsistency { creator_id, detail }
            }
            LedgerError::ConcurrencyConflict { attempts } => {
                PayoutError::ConcurrencyConflict { attempts }
            }
            LedgerError::LockPoisoned => PayoutError::LockPoisoned,
            LedgerError::Db(db) => PayoutError::from(db),
            other => PayoutError::Ledger(other),
        }
    }
}

impl TxError for PayoutError {
    fn is_conflict(&self) -> bool {
        match self {
            PayoutError::Db(e) => e.is_busy(),
            _ => false,
        }
    }

    fn conflict_exhausted(attempts: u32) -> Self {
        PayoutError::ConcurrencyConflict { attempts }
    }
}

/// Convenience result type for payout operations.
pub type Result<T> = std::result::Result<T, PayoutError>;
