//! Posting raw revenue events to the ledger.
//!
//! One event is one `BEGIN IMMEDIATE` transaction: resolve the referrer,
//! evaluate the commission rules, append every resulting entry, and record
//! bonus grants and anomalies. A failure anywhere leaves no trace.

use std::collections::HashSet;

use creatorpay_commission::{evaluate, Allocation, CommissionContext, ReferrerState};
use creatorpay_db::queries::{controls, rules};
use creatorpay_db::{to_minor, txn, SharedConnection};
use creatorpay_referral::ReferralResolver;
use creatorpay_types::event::RawEvent;
use creatorpay_types::shares::ShareTable;
use creatorpay_types::{EntryId, UserId};
use rusqlite::Connection;
use serde::Serialize;

use crate::store::{append_in, lock};
use crate::{LedgerError, Result};

/// Anomaly kind recorded when an event names a referrer other than the
/// creator's bound one.
pub const REFERRER_OVERRIDE: &str = "referrer_override";

/// What a posted event produced.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PostedEvent {
    pub allocation: Allocation,
    /// Ids of the appended entries, in the order of `allocation.drafts`.
    pub entry_ids: Vec<EntryId>,
    /// The referrer the event was attributed to, if any.
    pub referrer_id: Option<UserId>,
    /// A referrer named by the event but overruled by the creator's binding.
    pub overridden_referrer: Option<UserId>,
}

/// Posts raw events through the commission engine into the ledger.
#[derive(Clone, Debug)]
pub struct EventPoster {
    conn: SharedConnection,
    shares: ShareTable,
    resolver: ReferralResolver,
}

impl EventPoster {
    /// # Errors
    ///
    /// - [`LedgerError::Validation`] if a share fraction is outside `[0, 1]`
    pub fn new(conn: SharedConnection, shares: ShareTable, resolver: ReferralResolver) -> Result<Self> {
        if let Some(source) = shares.invalid_source() {
            return Err(LedgerError::Validation(format!(
                "platform share for {} is outside [0, 1]",
                source.as_str()
            )));
        }
        Ok(Self {
            conn,
            shares,
            resolver,
        })
    }

    pub fn shares(&self) -> &ShareTable {
        &self.shares
    }

    /// Allocate and append one event.
    ///
    /// The creator's referral binding, when there is one, decides the
    /// referrer. A referrer named on the event only counts for unbound
    /// creators; a differing name is recorded as a [`REFERRER_OVERRIDE`]
    /// anomaly.
    pub fn post(&self, event: &RawEvent, now: u64) -> Result<PostedEvent> {
        let mut conn = lock(&self.conn)?;
        let posted = txn::immediate(&mut conn, |tx| self.post_in(tx, event, now))?;

        tracing::info!(
            creator = %event.creator_id,
            source = event.source.as_str(),
            gross = %event.gross_amount,
            creator_net = %posted.allocation.creator_net,
            referrer = ?posted.referrer_id.as_ref().map(|r| r.as_str()),
            referrer_net = %posted.allocation.referrer_net,
            bonuses = posted.allocation.bonuses.len(),
            platform_retained = %posted.allocation.platform_retained,
            entries = posted.entry_ids.len(),
            "revenue event posted"
        );
        if let Some(named) = &posted.overridden_referrer {
            tracing::warn!(
                creator = %event.creator_id,
                named = %named,
                bound = ?posted.referrer_id.as_ref().map(|r| r.as_str()),
                "event referrer overruled by binding"
            );
        }
        if let Some(anomaly) = &posted.allocation.anomaly {
            tracing::warn!(
                creator = %anomaly.creator_id,
                referrer = %anomaly.referrer_id,
                kind = anomaly.kind.as_str(),
                retained = %anomaly.amount,
                "referral share retained by platform"
            );
        }
        Ok(posted)
    }

    fn post_in(&self, tx: &Connection, event: &RawEvent, now: u64) -> Result<PostedEvent> {
        // A binding is permanent: it wins over whatever the event names.
        let mut event = event.clone();
        let mut overridden_referrer = None;
        if let Some(bound) = self.resolver.resolve_referrer(tx, &event.creator_id)? {
            if let Some(named) = event.referrer_id.replace(bound.clone()) {
                if named != bound {
                    controls::insert_anomaly(
                        tx,
                        &controls::AnomalyRow {
                            creator_id: event.creator_id.clone(),
                            kind: REFERRER_OVERRIDE.to_string(),
                            detail: format!("event named referrer {named}, bound referrer {bound} kept"),
                            amount_minor: 0,
                            at: now,
                        },
                    )?;
                    overridden_referrer = Some(named);
                }
            }
        }

        let state = match &event.referrer_id {
            None => ReferrerState::None,
            Some(referrer_id) => self.resolver.referrer_state(tx, referrer_id, now)?,
        };
        let (active_rules, granted) = match &state {
            ReferrerState::Active { referrer_id, .. } => (
                rules::active_rules(tx)?,
                rules::granted_rules(tx, referrer_id)?,
            ),
            _ => (Vec::new(), HashSet::new()),
        };

        let ctx = CommissionContext {
            shares: &self.shares,
            referrer: &state,
            rules: &active_rules,
            granted: &granted,
        };
        let allocation = evaluate(&event, &ctx)?;

        let entry_ids = allocation
            .drafts
            .iter()
            .map(|draft| append_in(tx, draft))
            .collect::<Result<Vec<_>>>()?;
        let entry_at = |index: usize| {
            entry_ids.get(index).copied().ok_or_else(|| {
                LedgerError::Validation(format!("allocation references missing draft {index}"))
            })
        };

        if let Some(referrer_id) = state.referrer_id() {
            for bonus in allocation.bonuses.iter().filter(|b| !b.is_recurring) {
                rules::insert_grant(tx, bonus.rule_id, referrer_id, entry_at(bonus.draft_index)?, now)?;
            }
            if let Some(tier_bonus) = &allocation.tier_bonus_paid {
                rules::insert_tier_bonus(
                    tx,
                    tier_bonus.tier_level,
                    referrer_id,
                    entry_at(tier_bonus.draft_index)?,
                    now,
                )?;
            }
        }

        if let Some(anomaly) = &allocation.anomaly {
            controls::insert_anomaly(
                tx,
                &controls::AnomalyRow {
                    creator_id: anomaly.creator_id.clone(),
                    kind: anomaly.kind.as_str().to_string(),
                    detail: format!("referrer {}: {}", anomaly.referrer_id, anomaly.detail),
                    amount_minor: to_minor(anomaly.amount)?,
                    at: now,
                },
            )?;
        }

        Ok(PostedEvent {
            referrer_id: event.referrer_id.clone(),
            overridden_referrer,
            allocation,
            entry_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::BalanceCalculator;
    use crate::store::{EntryFilter, LedgerStore};
    use creatorpay_referral::{config, AllowAll};
    use creatorpay_types::ledger::{EntryStatus, RevenueSource};
    use creatorpay_types::referral::{BonusRuleType, ReferralBonusRule, ReferralTier, TriggerCondition};
    use creatorpay_types::RuleId;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    struct Harness {
        conn: SharedConnection,
        poster: EventPoster,
        store: LedgerStore,
        resolver: ReferralResolver,
    }

    fn harness() -> Harness {
        let conn = creatorpay_db::shared(creatorpay_db::open_memory().expect("open"));
        let resolver = ReferralResolver::new(Arc::new(AllowAll));
        let poster = EventPoster::new(conn.clone(), ShareTable::default(), resolver.clone())
            .expect("poster");
        Harness {
            store: LedgerStore::new(conn.clone()),
            conn,
            poster,
            resolver,
        }
    }

    fn event(source: RevenueSource, gross: Decimal, creator: &str) -> RawEvent {
        RawEvent {
            source,
            gross_amount: gross,
            creator_id: UserId::from(creator),
            referrer_id: None,
            occurred_at: 1_000,
        }
    }

    fn refer(h: &Harness, referrer: &str, creator: &str) {
        let conn = h.conn.lock().expect("lock");
        let code = format!("{}-CODE", referrer.to_uppercase());
        h.resolver
            .register_code(&conn, &UserId::from(referrer), &code, 1)
            .expect("code");
        h.resolver
            .bind(&conn, &UserId::from(creator), &code, 2)
            .expect("bind");
    }

    #[test]
    fn test_tip_creates_one_pending_entry() {
        let h = harness();
        let posted = h
            .poster
            .post(&event(RevenueSource::Tip, dec!(100.00), "c1"), 1_000)
            .expect("post");
        assert_eq!(posted.entry_ids.len(), 1);

        let entry = h.store.get(posted.entry_ids[0]).expect("entry");
        assert_eq!(entry.net_amount, dec!(90.00));
        assert_eq!(entry.status, EntryStatus::Pending);
        assert_eq!(entry.platform_share_fraction, dec!(0.10));
    }

    #[test]
    fn test_bound_referrer_earns_commission() {
        let h = harness();
        refer(&h, "ref", "c1");

        let posted = h
            .poster
            .post(&event(RevenueSource::Ad, dec!(40.00), "c1"), 1_000)
            .expect("post");
        assert_eq!(posted.referrer_id, Some(UserId::from("ref")));
        assert_eq!(posted.allocation.creator_net, dec!(26.00));
        assert_eq!(posted.allocation.referrer_net, dec!(4.00));
        assert_eq!(posted.allocation.platform_retained, dec!(10.00));

        let referral_total = h
            .store
            .sum_by_creator(&UserId::from("ref"), &EntryFilter::sources([RevenueSource::Referral]))
            .expect("sum");
        assert_eq!(referral_total, dec!(4.00));
    }

    #[test]
    fn test_binding_overrules_named_referrer() {
        let h = harness();
        refer(&h, "alice", "c1");

        let mut tip = event(RevenueSource::Tip, dec!(100.00), "c1");
        tip.referrer_id = Some(UserId::from("bob"));
        let posted = h.poster.post(&tip, 1_000).expect("post");

        assert_eq!(posted.referrer_id, Some(UserId::from("alice")));
        assert_eq!(posted.overridden_referrer, Some(UserId::from("bob")));
        let earned = |user: &str| {
            h.store
                .sum_by_creator(&UserId::from(user), &EntryFilter::all())
                .expect("sum")
        };
        assert_eq!(earned("alice"), dec!(10.00));
        assert_eq!(earned("bob"), Decimal::ZERO);

        let anomalies = h.store.anomalies(&UserId::from("c1")).expect("anomalies");
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, REFERRER_OVERRIDE);

        // Naming the bound referrer again is not an anomaly.
        tip.referrer_id = Some(UserId::from("alice"));
        let posted = h.poster.post(&tip, 1_001).expect("post");
        assert_eq!(posted.overridden_referrer, None);
        assert_eq!(h.store.anomalies(&UserId::from("c1")).expect("anomalies").len(), 1);
    }

    #[test]
    fn test_non_recurring_bonus_fires_once() {
        let h = harness();
        refer(&h, "ref", "c1");
        {
            let conn = h.conn.lock().expect("lock");
            config::upsert_rule(
                &conn,
                &ReferralBonusRule {
                    id: RuleId(0),
                    name: "first referral".to_string(),
                    rule_type: BonusRuleType::Milestone,
                    trigger: TriggerCondition::MinReferrals { count: 1 },
                    bonus_amount: dec!(5.00),
                    bonus_percentage: dec!(0),
                    is_recurring: false,
                    priority: 1,
                    is_active: true,
                },
            )
            .expect("rule");
        }

        let first = h
            .poster
            .post(&event(RevenueSource::Tip, dec!(10.00), "c1"), 1_000)
            .expect("post");
        assert_eq!(first.allocation.bonus_total(), dec!(5.00));
        let second = h
            .poster
            .post(&event(RevenueSource::Tip, dec!(10.00), "c1"), 1_001)
            .expect("post");
        assert!(second.allocation.bonuses.is_empty());

        // 1.00 + 1.00 commission plus a single 5.00 bonus.
        let total = h
            .store
            .sum_by_creator(&UserId::from("ref"), &EntryFilter::all())
            .expect("sum");
        assert_eq!(total, dec!(7.00));
    }

    #[test]
    fn test_tier_bonus_paid_once() {
        let h = harness();
        refer(&h, "ref", "c1");
        {
            let conn = h.conn.lock().expect("lock");
            config::replace_tiers(
                &conn,
                &[ReferralTier {
                    tier_level: 1,
                    tier_name: "Bronze".to_string(),
                    min_referrals: 0,
                    min_commission: dec!(0),
                    commission_rate: dec!(0.10),
                    bonus_per_referral: dec!(0.25),
                    tier_bonus: dec!(2.00),
                    is_active: true,
                }],
            )
            .expect("tiers");
        }

        let first = h
            .poster
            .post(&event(RevenueSource::Tip, dec!(10.00), "c1"), 1_000)
            .expect("post");
        assert_eq!(first.allocation.referrer_net, dec!(3.25));
        let second = h
            .poster
            .post(&event(RevenueSource::Tip, dec!(10.00), "c1"), 1_001)
            .expect("post");
        assert_eq!(second.allocation.referrer_net, dec!(1.25));
        assert!(second.allocation.tier_bonus_paid.is_none());
    }

    #[test]
    fn test_inactive_referrer_is_recorded_as_anomaly() {
        let h = harness();
        refer(&h, "ref", "c1");
        {
            let conn = h.conn.lock().expect("lock");
            h.resolver
                .set_account_active(&conn, &UserId::from("ref"), false, 3)
                .expect("deactivate");
        }

        let posted = h
            .poster
            .post(&event(RevenueSource::Tip, dec!(100.00), "c1"), 1_000)
            .expect("post");
        assert_eq!(posted.entry_ids.len(), 1);
        assert_eq!(posted.allocation.platform_retained, dec!(10.00));

        let anomalies = h.store.anomalies(&UserId::from("c1")).expect("anomalies");
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, "inactive_referrer");
        assert_eq!(anomalies[0].amount_minor, 1000);
    }

    #[test]
    fn test_failed_event_leaves_no_trace() {
        let h = harness();
        let err = h
            .poster
            .post(&event(RevenueSource::Tip, dec!(0.001), "c1"), 1_000)
            .expect_err("sub-cent");
        assert!(matches!(err, LedgerError::Commission(_)));
        assert_eq!(h.store.list_by_creator(&UserId::from("c1"), None).count(), 0);

        let calc = BalanceCalculator::new(h.conn.clone());
        assert_eq!(calc.get_balance(&UserId::from("c1"), 1_000).expect("balance").available, dec!(0));
    }

    #[test]
    fn test_rejects_invalid_share_table() {
        let conn = creatorpay_db::shared(creatorpay_db::open_memory().expect("open"));
        let shares = ShareTable {
            tip: dec!(-0.1),
            ..ShareTable::default()
        };
        assert!(EventPoster::new(conn, shares, ReferralResolver::new(Arc::new(AllowAll))).is_err());
    }
}
