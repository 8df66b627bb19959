//! Bonus rule trigger matching.

use creatorpay_types::referral::{ReferrerStats, TriggerCondition};

/// Whether a trigger condition holds for a referrer's current stats.
pub fn matches(trigger: &TriggerCondition, stats: &ReferrerStats) -> bool {
    match trigger {
        TriggerCondition::Always => true,
        TriggerCondition::MinReferrals { count } => stats.qualified_referrals >= *count,
        TriggerCondition::MaxReferrals { count } => stats.qualified_referrals <= *count,
        TriggerCondition::MinCommission { amount } => stats.lifetime_commission >= *amount,
        TriggerCondition::StreakDays { days } => stats.streak_days >= *days,
        TriggerCondition::ReferralsWithinDays { count, days } => {
            stats.referrals_within_days(*days) >= *count
        }
    }
}
