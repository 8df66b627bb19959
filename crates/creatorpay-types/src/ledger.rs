//! Ledger entry structures.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{EntryId, RequestId, TypesError, UserId};

/// Origin of a ledger entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ts_rs::TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum RevenueSource {
    Tip,
    Subscription,
    Ad,
    Affiliate,
    Referral,
    PlatformWithdrawal,
}

impl RevenueSource {
    /// All sources in storage order.
    pub const ALL: [RevenueSource; 6] = [
        RevenueSource::Tip,
        RevenueSource::Subscription,
        RevenueSource::Ad,
        RevenueSource::Affiliate,
        RevenueSource::Referral,
        RevenueSource::PlatformWithdrawal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RevenueSource::Tip => "tip",
            RevenueSource::Subscription => "subscription",
            RevenueSource::Ad => "ad",
            RevenueSource::Affiliate => "affiliate",
            RevenueSource::Referral => "referral",
            RevenueSource::PlatformWithdrawal => "platform_withdrawal",
        }
    }

    /// Withdrawals are debits; every other source is an earning.
    pub fn is_withdrawal(&self) -> bool {
        matches!(self, RevenueSource::PlatformWithdrawal)
    }
}

impl FromStr for RevenueSource {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RevenueSource::ALL
            .into_iter()
            .find(|src| src.as_str() == s)
            .ok_or_else(|| TypesError::UnknownVariant {
                kind: "revenue source",
                value: s.to_string(),
            })
    }
}

/// Settlement status of a ledger entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ts_rs::TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Paid,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Paid => "paid",
        }
    }
}

impl FromStr for EntryStatus {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EntryStatus::Pending),
            "paid" => Ok(EntryStatus::Paid),
            other => Err(TypesError::UnknownVariant {
                kind: "entry status",
                value: other.to_string(),
            }),
        }
    }
}

/// An immutable, appended ledger fact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ts_rs::TS)]
#[ts(export)]
pub struct RevenueEntry {
    pub id: EntryId,
    pub creator_id: UserId,
    pub source: RevenueSource,
    #[ts(type = "string")]
    pub gross_amount: Decimal,
    #[ts(type = "string")]
    pub platform_share_fraction: Decimal,
    #[ts(type = "string")]
    pub net_amount: Decimal,
    pub status: EntryStatus,
    pub occurred_at: u64,
    /// Set only on `platform_withdrawal` entries.
    pub payout_request_id: Option<RequestId>,
    /// Set only on corrections: the entry this one offsets.
    pub reverses_entry_id: Option<EntryId>,
    pub memo: Option<String>,
}

impl RevenueEntry {
    pub fn is_correction(&self) -> bool {
        self.reverses_entry_id.is_some()
    }
}

/// A ledger entry that has not been appended yet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntryDraft {
    pub creator_id: UserId,
    pub source: RevenueSource,
    pub gross_amount: Decimal,
    pub platform_share_fraction: Decimal,
    pub net_amount: Decimal,
    pub status: EntryStatus,
    pub occurred_at: u64,
    pub payout_request_id: Option<RequestId>,
    pub reverses_entry_id: Option<EntryId>,
    pub memo: Option<String>,
}

impl EntryDraft {
    /// An earning with `net = round_half_even(gross * (1 - share))`.
    ///
    /// Returns `None` on arithmetic overflow.
    pub fn earning(
        creator_id: UserId,
        source: RevenueSource,
        gross_amount: Decimal,
        platform_share_fraction: Decimal,
        occurred_at: u64,
    ) -> Option<Self> {
        let net_amount = crate::money::net_of_share(gross_amount, platform_share_fraction)?;
        Some(Self {
            creator_id,
            source,
            gross_amount,
            platform_share_fraction,
            net_amount,
            status: EntryStatus::Pending,
            occurred_at,
            payout_request_id: None,
            reverses_entry_id: None,
            memo: None,
        })
    }

    /// The offsetting debit for a completed payout. Always `paid`.
    pub fn withdrawal(
        creator_id: UserId,
        amount: Decimal,
        request_id: RequestId,
        occurred_at: u64,
    ) -> Self {
        Self {
            creator_id,
            source: RevenueSource::PlatformWithdrawal,
            gross_amount: -amount,
            platform_share_fraction: Decimal::ZERO,
            net_amount: -amount,
            status: EntryStatus::Paid,
            occurred_at,
            payout_request_id: Some(request_id),
            reverses_entry_id: None,
            memo: Some(format!("payout request {request_id}")),
        }
    }

    /// The entry that cancels `original`: same source and share, gross and
    /// net negated. Half-even rounding is symmetric, so the negated net is
    /// still `round(gross * (1 - share))`.
    pub fn correction(original: &RevenueEntry, memo: impl Into<String>, occurred_at: u64) -> Self {
        Self {
            creator_id: original.creator_id.clone(),
            source: original.source,
            gross_amount: -original.gross_amount,
            platform_share_fraction: original.platform_share_fraction,
            net_amount: -original.net_amount,
            status: EntryStatus::Pending,
            occurred_at,
            payout_request_id: None,
            reverses_entry_id: Some(original.id),
            memo: Some(memo.into()),
        }
    }

    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_source_round_trip_names() {
        for src in RevenueSource::ALL {
            assert_eq!(src.as_str().parse::<RevenueSource>().expect("parse"), src);
        }
        assert!("refund".parse::<RevenueSource>().is_err());
    }

    #[test]
    fn test_earning_draft_rounds() {
        let draft = EntryDraft::earning(
            UserId::from("c1"),
            RevenueSource::Tip,
            dec!(100),
            dec!(0.10),
            1_700_000_000,
        )
        .expect("draft");
        assert_eq!(draft.net_amount, dec!(90.00));
        assert_eq!(draft.status, EntryStatus::Pending);
    }

    #[test]
    fn test_withdrawal_draft_is_negative_and_paid() {
        let draft = EntryDraft::withdrawal(UserId::from("c1"), dec!(50), RequestId(7), 10);
        assert_eq!(draft.net_amount, dec!(-50));
        assert_eq!(draft.status, EntryStatus::Paid);
        assert_eq!(draft.payout_request_id, Some(RequestId(7)));
        assert!(draft.source.is_withdrawal());
    }

    #[test]
    fn test_correction_negates_original() {
        let original = RevenueEntry {
            id: EntryId(3),
            creator_id: UserId::from("c1"),
            source: RevenueSource::Ad,
            gross_amount: dec!(0.25),
            platform_share_fraction: dec!(0.35),
            net_amount: dec!(0.16),
            status: EntryStatus::Paid,
            occurred_at: 10,
            payout_request_id: None,
            reverses_entry_id: None,
            memo: None,
        };
        let draft = EntryDraft::correction(&original, "chargeback", 20);
        assert_eq!(draft.gross_amount, dec!(-0.25));
        assert_eq!(draft.net_amount, dec!(-0.16));
        assert_eq!(
            crate::money::net_of_share(draft.gross_amount, draft.platform_share_fraction),
            Some(draft.net_amount)
        );
        assert_eq!(draft.source, RevenueSource::Ad);
        assert_eq!(draft.status, EntryStatus::Pending);
        assert_eq!(draft.reverses_entry_id, Some(EntryId(3)));
        assert_eq!(draft.memo.as_deref(), Some("chargeback"));
    }
}
