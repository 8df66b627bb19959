//! # creatorpay-referral
//!
//! Referral attribution: who referred whom, how much a referrer has earned,
//! and which commission tier currently applies.
//!
//! ## Modules
//!
//! - [`abuse`]: Qualification gate supplied by an abuse-detection service
//! - [`config`]: Tier table and bonus rule administration
//! - [`resolver`]: Code registration, binding and referrer resolution
//! - [`tiers`]: Tier selection and referral streaks

pub mod abuse;
pub mod config;
pub mod resolver;
pub mod tiers;

pub use abuse::{AbuseSignal, AllowAll, DenyList};
pub use resolver::{BindOutcome, ReferralResolver};

/// Error types for referral operations.
#[derive(Debug, thiserror::Error)]
pub enum ReferralError {
    /// Input rejected before touching storage.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The tier table or a rule is unusable.
    #[error("invalid referral configuration: {0}")]
    Configuration(String),

    /// Unknown referral code or binding.
    #[error("not found: {0}")]
    NotFound(String),

    /// Storage failure.
    #[error("database error: {0}")]
    Db(#[from] creatorpay_db::DbError),
}

impl From<rusqlite::Error> for ReferralError {
    fn from(err: rusqlite::Error) -> Self {
        ReferralError::Db(creatorpay_db::DbError::Sqlite(err))
    }
}

/// Convenience result type for referral operations.
pub type Result<T> = std::result::Result<T, ReferralError>;
