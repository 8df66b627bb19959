//! # creatorpay-types
//!
//! Shared domain types used across the creatorpay workspace: identifiers,
//! money helpers, ledger entries, referral configuration and payout
//! requests.

pub mod event;
pub mod ledger;
pub mod money;
pub mod payout;
pub mod referral;
pub mod shares;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Default settlement currency (ISO 4217).
pub const DEFAULT_CURRENCY: &str = "USD";

/// Seconds in one day.
pub const SECONDS_PER_DAY: u64 = 86_400;

/// Get the current Unix timestamp in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Opaque user identifier (creator, referrer, referred user or admin).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ts_rs::TS)]
#[ts(export)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Row id of a [`ledger::RevenueEntry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ts_rs::TS)]
#[ts(export)]
#[serde(transparent)]
pub struct EntryId(pub i64);

/// Row id of a [`payout::PayoutRequest`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ts_rs::TS)]
#[ts(export)]
#[serde(transparent)]
pub struct RequestId(pub i64);

/// Row id of a [`referral::ReferralBonusRule`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ts_rs::TS)]
#[ts(export)]
#[serde(transparent)]
pub struct RuleId(pub i64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors raised while decoding persisted enum values.
#[derive(Debug, thiserror::Error)]
pub enum TypesError {
    #[error("unknown {kind}: {value}")]
    UnknownVariant {
        /// Which enum was being parsed.
        kind: &'static str,
        /// The offending value.
        value: String,
    },
}
