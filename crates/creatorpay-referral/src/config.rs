//! Tier table and bonus rule administration.

use creatorpay_db::queries::rules;
use creatorpay_types::money::{is_minor_exact, is_unit_fraction};
use creatorpay_types::referral::{ReferralBonusRule, ReferralTier, TriggerCondition};
use creatorpay_types::RuleId;
use rusqlite::Connection;
use rust_decimal::Decimal;

use crate::tiers::validate_tiers;
use crate::{ReferralError, Result};

/// Replace the whole tier table after validating it.
pub fn replace_tiers(conn: &Connection, tiers: &[ReferralTier]) -> Result<()> {
    validate_tiers(tiers)?;
    let tx = conn.unchecked_transaction()?;
    rules::replace_tiers(&tx, tiers)?;
    tx.commit()?;
    tracing::info!(count = tiers.len(), "referral tiers replaced");
    Ok(())
}

/// The current tier table ordered by level.
pub fn tiers(conn: &Connection) -> Result<Vec<ReferralTier>> {
    Ok(rules::tiers(conn)?)
}

/// Create (id 0) or update a bonus rule.
pub fn upsert_rule(conn: &Connection, rule: &ReferralBonusRule) -> Result<RuleId> {
    validate_rule(rule)?;
    let id = rules::upsert_rule(conn, rule)?;
    tracing::info!(
        rule_id = id.0,
        name = %rule.name,
        rule_type = rule.rule_type.as_str(),
        priority = rule.priority,
        recurring = rule.is_recurring,
        active = rule.is_active,
        "bonus rule saved"
    );
    Ok(id)
}

/// Active rules in evaluation order.
pub fn active_rules(conn: &Connection) -> Result<Vec<ReferralBonusRule>> {
    Ok(rules::active_rules(conn)?)
}

fn validate_rule(rule: &ReferralBonusRule) -> Result<()> {
    if rule.name.trim().is_empty() {
        return Err(ReferralError::Validation("bonus rule needs a name".to_string()));
    }
    if rule.bonus_amount < Decimal::ZERO || !is_minor_exact(rule.bonus_amount) {
        return Err(ReferralError::Validation(format!(
            "bonus amount {} must be a non-negative whole-cent amount",
            rule.bonus_amount
        )));
    }
    if !is_unit_fraction(rule.bonus_percentage) {
        return Err(ReferralError::Validation(format!(
            "bonus percentage {} is outside [0, 1]",
            rule.bonus_percentage
        )));
    }
    if rule.bonus_amount.is_zero() && rule.bonus_percentage.is_zero() {
        return Err(ReferralError::Validation(format!(
            "bonus rule {:?} pays nothing",
            rule.name
        )));
    }
    match &rule.trigger {
        TriggerCondition::MinCommission { amount } if *amount < Decimal::ZERO => Err(
            ReferralError::Validation("commission threshold cannot be negative".to_string()),
        ),
        TriggerCondition::ReferralsWithinDays { days: 0, .. } => Err(ReferralError::Validation(
            "referral window must be at least one day".to_string(),
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use creatorpay_types::referral::BonusRuleType;
    use rust_decimal_macros::dec;

    fn rule() -> ReferralBonusRule {
        ReferralBonusRule {
            id: RuleId(0),
            name: "ten referrals".to_string(),
            rule_type: BonusRuleType::Milestone,
            trigger: TriggerCondition::MinReferrals { count: 10 },
            bonus_amount: dec!(25.00),
            bonus_percentage: dec!(0),
            is_recurring: false,
            priority: 10,
            is_active: true,
        }
    }

    #[test]
    fn test_upsert_validates() {
        let conn = creatorpay_db::open_memory().expect("open");
        let id = upsert_rule(&conn, &rule()).expect("insert");
        assert_eq!(active_rules(&conn).expect("rules")[0].id, id);

        let nothing = ReferralBonusRule {
            bonus_amount: dec!(0),
            ..rule()
        };
        assert!(matches!(upsert_rule(&conn, &nothing), Err(ReferralError::Validation(_))));

        let window = ReferralBonusRule {
            trigger: TriggerCondition::ReferralsWithinDays { count: 3, days: 0 },
            ..rule()
        };
        assert!(matches!(upsert_rule(&conn, &window), Err(ReferralError::Validation(_))));
    }

    #[test]
    fn test_replace_tiers_rejects_missing_base() {
        let conn = creatorpay_db::open_memory().expect("open");
        let silver = ReferralTier {
            tier_level: 2,
            tier_name: "Silver".to_string(),
            min_referrals: 5,
            min_commission: dec!(25),
            commission_rate: dec!(0.12),
            bonus_per_referral: dec!(0),
            tier_bonus: dec!(0),
            is_active: true,
        };
        assert!(matches!(
            replace_tiers(&conn, &[silver]),
            Err(ReferralError::Configuration(_))
        ));
        // The default tier table survives the rejected replacement.
        assert_eq!(tiers(&conn).expect("tiers").len(), 1);
    }
}
