//! # creatorpay-commission
//!
//! Commission rule engine.
//!
//! Turns a raw monetary event into an [`engine::Allocation`]: the creator's
//! net, the referrer's commission and bonuses, and what the platform keeps.
//! The engine is pure. It reads nothing from storage; callers resolve the
//! referrer and the rule set first and pass them in a
//! [`engine::CommissionContext`].
//!
//! ## Modules
//!
//! - [`engine`]: Allocation of a single event
//! - [`triggers`]: Bonus rule trigger matching

pub mod engine;
pub mod triggers;

pub use engine::{
    evaluate, Allocation, Anomaly, AnomalyKind, BonusAward, CommissionContext, ReferrerState,
    TierBonus,
};

/// Error types for commission evaluation.
#[derive(Debug, thiserror::Error)]
pub enum CommissionError {
    /// The event or configuration is malformed.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Arithmetic overflow.
    #[error("arithmetic overflow in commission calculation")]
    Overflow,

    /// The allocation does not add back up to the gross amount.
    #[error("allocation does not conserve gross {gross}: allocated {allocated}")]
    LedgerInconsistency {
        /// Gross amount of the event.
        gross: rust_decimal::Decimal,
        /// Sum of all allocated parts.
        allocated: rust_decimal::Decimal,
    },
}

/// Convenience result type for commission operations.
pub type Result<T> = std::result::Result<T, CommissionError>;
