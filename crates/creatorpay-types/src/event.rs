//! Raw monetary events fed into the commission engine.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ledger::RevenueSource;
use crate::UserId;

/// An external revenue event (tip, subscription charge, ad click, ...).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub source: RevenueSource,
    pub gross_amount: Decimal,
    pub creator_id: UserId,
    /// Referrer credited for this event, if the creator or payer was referred.
    #[serde(default)]
    pub referrer_id: Option<UserId>,
    pub occurred_at: u64,
}
