//! # creatorpay-ledger
//!
//! The append-only revenue ledger and everything derived from it.
//!
//! ## Modules
//!
//! - [`store`]: Validated appends, filtered sums, entry cursors
//! - [`balance`]: Cached balances and reconciliation
//! - [`posting`]: Turning raw events into ledger entries

pub mod balance;
pub mod posting;
pub mod store;

pub use balance::{BalanceCalculator, ReconcileReport};
pub use posting::{EventPoster, PostedEvent};
pub use store::{EntryCursor, EntryFilter, LedgerStore};

use creatorpay_commission::CommissionError;
use creatorpay_db::txn::TxError;
use creatorpay_db::DbError;
use creatorpay_referral::ReferralError;
use creatorpay_types::UserId;

/// Error types for ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// An entry or event was rejected.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The ledger disagrees with itself. The creator has been frozen.
    #[error("ledger inconsistency for {creator_id}: {detail}")]
    LedgerInconsistency {
        /// Affected creator.
        creator_id: UserId,
        /// What did not match.
        detail: String,
    },

    /// Another writer held the database for too long.
    #[error("concurrency conflict after {attempts} attempts")]
    ConcurrencyConflict {
        /// Attempts made, including the first.
        attempts: u32,
    },

    /// The shared connection lock was poisoned by a panicking holder.
    #[error("database connection lock poisoned")]
    LockPoisoned,

    /// Commission evaluation failed.
    #[error(transparent)]
    Commission(#[from] CommissionError),

    /// Referral resolution failed.
    #[error(transparent)]
    Referral(#[from] ReferralError),

    /// Storage failure.
    #[error("database error: {0}")]
    Db(#[from] DbError),
}

impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        LedgerError::Db(DbError::Sqlite(err))
    }
}

impl TxError for LedgerError {
    fn is_conflict(&self) -> bool {
        match self {
            LedgerError::Db(e) | LedgerError::Referral(ReferralError::Db(e)) => e.is_busy(),
            _ => false,
        }
    }

    fn conflict_exhausted(attempts: u32) -> Self {
        LedgerError::ConcurrencyConflict { attempts }
    }
}

/// Convenience result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;
