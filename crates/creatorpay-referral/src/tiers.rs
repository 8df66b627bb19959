//! Tier selection and referral streaks.

use std::collections::{BTreeSet, HashSet};

use creatorpay_types::money::{is_minor_exact, is_unit_fraction};
use creatorpay_types::referral::{ReferralTier, ReferrerStats};
use creatorpay_types::SECONDS_PER_DAY;
use rust_decimal::Decimal;

use crate::{ReferralError, Result};

/// Level of the tier every referrer falls back to.
pub const BASE_TIER_LEVEL: u32 = 1;

/// Check a tier table before it is stored.
///
/// # Errors
///
/// - [`ReferralError::Configuration`] if there is no level-1 tier, a level
///   repeats, active tiers do not strictly increase in `min_referrals`, a
///   rate is outside `[0, 1]`, or an amount is negative or sub-cent
pub fn validate_tiers(tiers: &[ReferralTier]) -> Result<()> {
    let mut levels = HashSet::new();
    for tier in tiers {
        if tier.tier_level < BASE_TIER_LEVEL {
            return Err(ReferralError::Configuration(format!(
                "tier level must be at least 1, got {}",
                tier.tier_level
            )));
        }
        if !levels.insert(tier.tier_level) {
            return Err(ReferralError::Configuration(format!(
                "duplicate tier level {}",
                tier.tier_level
            )));
        }
        if !is_unit_fraction(tier.commission_rate) {
            return Err(ReferralError::Configuration(format!(
                "tier {} commission rate {} is outside [0, 1]",
                tier.tier_level, tier.commission_rate
            )));
        }
        for (what, amount) in [
            ("min_commission", tier.min_commission),
            ("bonus_per_referral", tier.bonus_per_referral),
            ("tier_bonus", tier.tier_bonus),
        ] {
            if amount < Decimal::ZERO || !is_minor_exact(amount) {
                return Err(ReferralError::Configuration(format!(
                    "tier {} {what} {amount} must be a non-negative whole-cent amount",
                    tier.tier_level
                )));
            }
        }
    }
    if !levels.contains(&BASE_TIER_LEVEL) {
        return Err(ReferralError::Configuration(
            "tier table has no level 1 tier".to_string(),
        ));
    }

    let mut active: Vec<&ReferralTier> = tiers.iter().filter(|t| t.is_active).collect();
    active.sort_by_key(|t| t.tier_level);
    for pair in active.windows(2) {
        if pair[1].min_referrals <= pair[0].min_referrals {
            return Err(ReferralError::Configuration(format!(
                "tier {} min_referrals {} must exceed tier {} min_referrals {}",
                pair[1].tier_level, pair[1].min_referrals, pair[0].tier_level, pair[0].min_referrals
            )));
        }
    }
    Ok(())
}

/// The highest active tier whose thresholds the referrer meets, falling
/// back to the level-1 tier.
///
/// # Errors
///
/// - [`ReferralError::Configuration`] if the table has no level-1 tier
pub fn select_tier(tiers: &[ReferralTier], stats: &ReferrerStats) -> Result<ReferralTier> {
    let qualified = tiers
        .iter()
        .filter(|t| t.is_active)
        .filter(|t| {
            stats.qualified_referrals >= t.min_referrals
                && stats.lifetime_commission >= t.min_commission
        })
        .max_by_key(|t| t.tier_level);

    if let Some(tier) = qualified {
        return Ok(tier.clone());
    }
    tiers
        .iter()
        .find(|t| t.tier_level == BASE_TIER_LEVEL)
        .cloned()
        .ok_or_else(|| ReferralError::Configuration("tier table has no level 1 tier".to_string()))
}

/// Length in days of the run of consecutive days with at least one
/// referral, ending today or yesterday.
pub fn streak_days(referral_times: &[u64], now: u64) -> u32 {
    let days: BTreeSet<u64> = referral_times
        .iter()
        .filter(|t| **t <= now)
        .map(|t| t / SECONDS_PER_DAY)
        .collect();
    let today = now / SECONDS_PER_DAY;

    let mut day = match days.last() {
        Some(last) if *last + 1 >= today => *last,
        _ => return 0,
    };
    let mut streak = 0u32;
    while days.contains(&day) {
        streak += 1;
        match day.checked_sub(1) {
            Some(prev) => day = prev,
            None => break,
        }
    }
    streak
}
