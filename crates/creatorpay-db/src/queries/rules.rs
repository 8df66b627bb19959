//! Referral tier, bonus rule and grant query functions.

use std::collections::HashSet;

use creatorpay_types::money::from_minor_units;
use creatorpay_types::referral::{BonusRuleType, ReferralBonusRule, ReferralTier, TriggerCondition};
use creatorpay_types::{EntryId, RuleId, UserId};
use rusqlite::Connection;

use crate::{map_constraint, parse_decimal, parse_enum, to_minor, DbError, Result};

/// All configured tiers ordered by `tier_level`.
pub fn tiers(conn: &Connection) -> Result<Vec<ReferralTier>> {
    let mut stmt = conn.prepare(
        "SELECT tier_level, tier_name, min_referrals, min_commission_minor, commission_rate,
                bonus_per_referral_minor, tier_bonus_minor, is_active
         FROM referral_tiers ORDER BY tier_level ASC",
    )?;
    let raw = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, u32>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, bool>(7)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    raw.into_iter()
        .map(
            |(level, name, min_refs, min_comm, rate, per_ref, tier_bonus, active)| {
                Ok(ReferralTier {
                    tier_level: level,
                    tier_name: name,
                    min_referrals: min_refs,
                    min_commission: from_minor_units(min_comm),
                    commission_rate: parse_decimal(&rate)?,
                    bonus_per_referral: from_minor_units(per_ref),
                    tier_bonus: from_minor_units(tier_bonus),
                    is_active: active,
                })
            },
        )
        .collect()
}

/// Replace the whole tier table. Call inside a transaction.
pub fn replace_tiers(conn: &Connection, tiers: &[ReferralTier]) -> Result<()> {
    conn.execute("DELETE FROM referral_tiers", [])?;
    let mut stmt = conn.prepare(
        "INSERT INTO referral_tiers
            (tier_level, tier_name, min_referrals, min_commission_minor, commission_rate,
             bonus_per_referral_minor, tier_bonus_minor, is_active)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    for tier in tiers {
        stmt.execute(rusqlite::params![
            tier.tier_level,
            tier.tier_name,
            tier.min_referrals,
            to_minor(tier.min_commission)?,
            tier.commission_rate.normalize().to_string(),
            to_minor(tier.bonus_per_referral)?,
            to_minor(tier.tier_bonus)?,
            tier.is_active,
        ])
        .map_err(|e| map_constraint(e, "referral tier"))?;
    }
    Ok(())
}

/// Insert a bonus rule (when `rule.id` is 0) or update an existing one.
pub fn upsert_rule(conn: &Connection, rule: &ReferralBonusRule) -> Result<RuleId> {
    let trigger = serde_json::to_string(&rule.trigger)
        .map_err(|e| DbError::Serialization(e.to_string()))?;
    let amount = to_minor(rule.bonus_amount)?;
    let percentage = rule.bonus_percentage.normalize().to_string();

    if rule.id.0 == 0 {
        conn.execute(
            "INSERT INTO bonus_rules
                (name, rule_type, trigger_condition, bonus_amount_minor, bonus_percentage,
                 is_recurring, priority, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                rule.name,
                rule.rule_type.as_str(),
                trigger,
                amount,
                percentage,
                rule.is_recurring,
                rule.priority,
                rule.is_active,
            ],
        )?;
        return Ok(RuleId(conn.last_insert_rowid()));
    }

    let updated = conn.execute(
        "UPDATE bonus_rules SET name = ?1, rule_type = ?2, trigger_condition = ?3,
            bonus_amount_minor = ?4, bonus_percentage = ?5, is_recurring = ?6,
            priority = ?7, is_active = ?8
         WHERE id = ?9",
        rusqlite::params![
            rule.name,
            rule.rule_type.as_str(),
            trigger,
            amount,
            percentage,
            rule.is_recurring,
            rule.priority,
            rule.is_active,
            rule.id.0,
        ],
    )?;
    if updated == 0 {
        return Err(DbError::NotFound(format!("bonus rule {}", rule.id)));
    }
    Ok(rule.id)
}

/// Active bonus rules in evaluation order: priority descending, then id.
pub fn active_rules(conn: &Connection) -> Result<Vec<ReferralBonusRule>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, rule_type, trigger_condition, bonus_amount_minor, bonus_percentage,
                is_recurring, priority, is_active
         FROM bonus_rules WHERE is_active = 1
         ORDER BY priority DESC, id ASC",
    )?;
    let raw = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, bool>(6)?,
                row.get::<_, i32>(7)?,
                row.get::<_, bool>(8)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    raw.into_iter()
        .map(
            |(id, name, rule_type, trigger, amount, pct, recurring, priority, active)| {
                let trigger: TriggerCondition = serde_json::from_str(&trigger)
                    .map_err(|e| DbError::Serialization(format!("rule {id} trigger: {e}")))?;
                Ok(ReferralBonusRule {
                    id: RuleId(id),
                    name,
                    rule_type: parse_enum::<BonusRuleType>(&rule_type)?,
                    trigger,
                    bonus_amount: from_minor_units(amount),
                    bonus_percentage: parse_decimal(&pct)?,
                    is_recurring: recurring,
                    priority,
                    is_active: active,
                })
            },
        )
        .collect()
}

/// Non-recurring rules already granted to a referrer.
pub fn granted_rules(conn: &Connection, referrer_id: &UserId) -> Result<HashSet<RuleId>> {
    let mut stmt = conn.prepare("SELECT rule_id FROM bonus_grants WHERE referrer_id = ?1")?;
    let ids = stmt
        .query_map([referrer_id.as_str()], |row| row.get::<_, i64>(0))?
        .collect::<std::result::Result<HashSet<_>, _>>()?;
    Ok(ids.into_iter().map(RuleId).collect())
}

/// Record a non-recurring grant. Fails with [`DbError::Constraint`] if the
/// rule was already granted to the referrer.
pub fn insert_grant(
    conn: &Connection,
    rule_id: RuleId,
    referrer_id: &UserId,
    entry_id: EntryId,
    now: u64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO bonus_grants (rule_id, referrer_id, entry_id, granted_at)
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![rule_id.0, referrer_id.as_str(), entry_id.0, now as i64],
    )
    .map_err(|e| map_constraint(e, "bonus grant"))?;
    Ok(())
}

/// Tier levels whose one-off tier bonus was already paid to a referrer.
pub fn paid_tier_bonuses(conn: &Connection, referrer_id: &UserId) -> Result<HashSet<u32>> {
    let mut stmt = conn.prepare("SELECT tier_level FROM tier_bonus_grants WHERE referrer_id = ?1")?;
    let levels = stmt
        .query_map([referrer_id.as_str()], |row| row.get::<_, u32>(0))?
        .collect::<std::result::Result<HashSet<_>, _>>()?;
    Ok(levels)
}

/// Record a paid tier bonus.
pub fn insert_tier_bonus(
    conn: &Connection,
    tier_level: u32,
    referrer_id: &UserId,
    entry_id: EntryId,
    now: u64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO tier_bonus_grants (tier_level, referrer_id, entry_id, granted_at)
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![tier_level, referrer_id.as_str(), entry_id.0, now as i64],
    )
    .map_err(|e| map_constraint(e, "tier bonus grant"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use creatorpay_types::ledger::{EntryDraft, RevenueSource};
    use rust_decimal_macros::dec;

    fn test_db() -> Connection {
        crate::open_memory().expect("open test db")
    }

    fn milestone(priority: i32) -> ReferralBonusRule {
        ReferralBonusRule {
            id: RuleId(0),
            name: format!("milestone-{priority}"),
            rule_type: BonusRuleType::Milestone,
            trigger: TriggerCondition::MinReferrals { count: 10 },
            bonus_amount: dec!(5.00),
            bonus_percentage: dec!(0),
            is_recurring: false,
            priority,
            is_active: true,
        }
    }

    #[test]
    fn test_replace_and_read_tiers() {
        let conn = test_db();
        let tiers_in = vec![
            ReferralTier {
                tier_level: 1,
                tier_name: "Bronze".into(),
                min_referrals: 0,
                min_commission: dec!(0),
                commission_rate: dec!(0.10),
                bonus_per_referral: dec!(0),
                tier_bonus: dec!(0),
                is_active: true,
            },
            ReferralTier {
                tier_level: 2,
                tier_name: "Silver".into(),
                min_referrals: 5,
                min_commission: dec!(25),
                commission_rate: dec!(0.12),
                bonus_per_referral: dec!(0.50),
                tier_bonus: dec!(10),
                is_active: true,
            },
        ];
        replace_tiers(&conn, &tiers_in).expect("replace");
        let out = tiers(&conn).expect("tiers");
        assert_eq!(out, tiers_in);
    }

    #[test]
    fn test_rules_ordered_by_priority() {
        let conn = test_db();
        let low = upsert_rule(&conn, &milestone(1)).expect("insert");
        let high = upsert_rule(&conn, &milestone(9)).expect("insert");
        let rules = active_rules(&conn).expect("rules");
        assert_eq!(rules.iter().map(|r| r.id).collect::<Vec<_>>(), vec![high, low]);

        let mut disabled = rules[0].clone();
        disabled.is_active = false;
        upsert_rule(&conn, &disabled).expect("update");
        assert_eq!(active_rules(&conn).expect("rules").len(), 1);
    }

    #[test]
    fn test_grant_dedup() {
        let conn = test_db();
        let rule = upsert_rule(&conn, &milestone(1)).expect("insert");
        let referrer = UserId::from("r1");
        let entry = crate::queries::entries::insert(
            &conn,
            &EntryDraft::earning(referrer.clone(), RevenueSource::Referral, dec!(5), dec!(0), 1)
                .expect("draft"),
        )
        .expect("entry");

        insert_grant(&conn, rule, &referrer, entry, 1).expect("first grant");
        assert!(matches!(
            insert_grant(&conn, rule, &referrer, entry, 2),
            Err(DbError::Constraint(_))
        ));
        assert!(granted_rules(&conn, &referrer).expect("granted").contains(&rule));
    }
}
