//! Referral tier and bonus-rule structures.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{RuleId, TypesError};

/// A commission-rate bracket, selected by cumulative referral performance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ts_rs::TS)]
#[ts(export)]
pub struct ReferralTier {
    /// Unique, ascending. Level 1 is the fallback tier.
    pub tier_level: u32,
    pub tier_name: String,
    pub min_referrals: u32,
    #[ts(type = "string")]
    pub min_commission: Decimal,
    /// Fraction of the event's gross amount paid to the referrer.
    #[ts(type = "string")]
    pub commission_rate: Decimal,
    /// Flat amount added per referred event.
    #[ts(type = "string")]
    pub bonus_per_referral: Decimal,
    /// One-off amount paid the first time a referrer reaches this tier.
    #[ts(type = "string")]
    pub tier_bonus: Decimal,
    pub is_active: bool,
}

/// Kind of a bonus rule. Informational; matching is driven by the trigger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BonusRuleType {
    Milestone,
    ActivityBased,
    Streak,
    PercentageBoost,
}

impl BonusRuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BonusRuleType::Milestone => "milestone",
            BonusRuleType::ActivityBased => "activity_based",
            BonusRuleType::Streak => "streak",
            BonusRuleType::PercentageBoost => "percentage_boost",
        }
    }
}

impl FromStr for BonusRuleType {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "milestone" => Ok(BonusRuleType::Milestone),
            "activity_based" => Ok(BonusRuleType::ActivityBased),
            "streak" => Ok(BonusRuleType::Streak),
            "percentage_boost" => Ok(BonusRuleType::PercentageBoost),
            other => Err(TypesError::UnknownVariant {
                kind: "bonus rule type",
                value: other.to_string(),
            }),
        }
    }
}

/// Condition under which a bonus rule fires, checked against the
/// referrer's aggregate state at the time of the event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerCondition {
    /// Fires on every event.
    Always,
    /// At least `count` qualified referrals.
    MinReferrals { count: u32 },
    /// At most `count` qualified referrals (new-referrer boosts).
    MaxReferrals { count: u32 },
    /// Lifetime referral commission of at least `amount`.
    MinCommission { amount: Decimal },
    /// Referral activity on at least `days` consecutive days.
    StreakDays { days: u32 },
    /// At least `count` qualified referrals in the trailing `days` days.
    ReferralsWithinDays { count: u32, days: u32 },
}

/// A stackable commission modifier, independent of tier.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReferralBonusRule {
    pub id: RuleId,
    pub name: String,
    pub rule_type: BonusRuleType,
    pub trigger: TriggerCondition,
    /// Flat bonus.
    pub bonus_amount: Decimal,
    /// Fraction of the event's gross amount.
    pub bonus_percentage: Decimal,
    /// Non-recurring rules fire at most once per referrer.
    pub is_recurring: bool,
    /// Evaluated in descending order.
    pub priority: i32,
    pub is_active: bool,
}

/// Aggregate counters of a referrer, feeding tier and bonus evaluation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferrerStats {
    /// Referred users that passed the abuse bar.
    pub qualified_referrals: u32,
    /// Sum of all referral-source ledger credits.
    pub lifetime_commission: Decimal,
    /// Consecutive days, ending today or yesterday, with a qualified referral.
    pub streak_days: u32,
    /// Bound-at timestamps of qualified referrals, ascending.
    pub referral_times: Vec<u64>,
    /// Evaluation time.
    pub as_of: u64,
}

impl ReferrerStats {
    /// Qualified referrals bound within the trailing `days` days.
    pub fn referrals_within_days(&self, days: u32) -> u32 {
        let window = u64::from(days) * crate::SECONDS_PER_DAY;
        let cutoff = self.as_of.saturating_sub(window);
        let recent = self
            .referral_times
            .iter()
            .filter(|t| **t >= cutoff && **t <= self.as_of)
            .count();
        u32::try_from(recent).unwrap_or(u32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_trigger_json_is_tagged() {
        let t = TriggerCondition::ReferralsWithinDays { count: 3, days: 7 };
        let json = serde_json::to_value(&t).expect("serialize");
        assert_eq!(json["kind"], "referrals_within_days");
        let back: TriggerCondition = serde_json::from_value(json).expect("parse");
        assert_eq!(back, t);

        let m: TriggerCondition =
            serde_json::from_str(r#"{"kind":"min_commission","amount":"25.00"}"#).expect("parse");
        assert_eq!(m, TriggerCondition::MinCommission { amount: dec!(25.00) });
    }

    #[test]
    fn test_unknown_trigger_rejected() {
        let err = serde_json::from_str::<TriggerCondition>(r#"{"kind":"moon_phase"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_referrals_within_days() {
        let day = crate::SECONDS_PER_DAY;
        let stats = ReferrerStats {
            referral_times: vec![0, 10 * day, 28 * day, 29 * day],
            as_of: 30 * day,
            ..Default::default()
        };
        assert_eq!(stats.referrals_within_days(7), 2);
        assert_eq!(stats.referrals_within_days(30), 4);
    }
}
