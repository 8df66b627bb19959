//! Integration test fixtures for the creator revenue engine.
//!
//! The tests under `tests/` drive the ledger, referral, commission and
//! payout crates together against one shared in-memory database, the same
//! way the daemon wires them.
//!
//! Run all integration tests:
//! ```sh
//! cargo test -p creatorpay-integration-tests
//! ```

use std::sync::Arc;

use creatorpay_db::SharedConnection;
use creatorpay_ledger::{BalanceCalculator, EventPoster, LedgerStore, PostedEvent};
use creatorpay_payout::{PayoutOrchestrator, PayoutPolicy};
use creatorpay_referral::{config, DenyList, ReferralResolver};
use creatorpay_types::event::RawEvent;
use creatorpay_types::ledger::RevenueSource;
use creatorpay_types::referral::{
    BonusRuleType, ReferralBonusRule, ReferralTier, TriggerCondition,
};
use creatorpay_types::shares::ShareTable;
use creatorpay_types::{RuleId, UserId};
use rusqlite::Connection;
use rust_decimal::Decimal;

/// Base timestamp for test scenarios.
pub const BASE_TIME: u64 = 1_700_000_000;

/// Every engine component over one shared connection.
pub struct Platform {
    pub conn: SharedConnection,
    pub store: LedgerStore,
    pub balances: BalanceCalculator,
    pub poster: EventPoster,
    pub payouts: PayoutOrchestrator,
    pub resolver: ReferralResolver,
    /// Users flagged here bind unqualified.
    pub abuse: Arc<DenyList>,
}

impl Platform {
    /// Default share table and payout policy.
    pub fn new() -> Self {
        Self::with(ShareTable::default(), PayoutPolicy::default())
    }

    pub fn with(shares: ShareTable, policy: PayoutPolicy) -> Self {
        let conn = creatorpay_db::shared(creatorpay_db::open_memory().expect("open DB"));
        let abuse = Arc::new(DenyList::new());
        let resolver = ReferralResolver::new(abuse.clone());
        Self {
            store: LedgerStore::new(conn.clone()),
            balances: BalanceCalculator::new(conn.clone()),
            poster: EventPoster::new(conn.clone(), shares, resolver.clone()).expect("poster"),
            payouts: PayoutOrchestrator::new(conn.clone(), policy).expect("orchestrator"),
            resolver,
            abuse,
            conn,
        }
    }

    /// Run `f` with the connection locked.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> T) -> T {
        let conn = self.conn.lock().expect("lock connection");
        f(&conn)
    }

    /// Post an event with no explicit referrer.
    pub fn post(&self, source: RevenueSource, gross: Decimal, creator: &str, at: u64) -> PostedEvent {
        self.poster
            .post(
                &RawEvent {
                    source,
                    gross_amount: gross,
                    creator_id: UserId::from(creator),
                    referrer_id: None,
                    occurred_at: at,
                },
                at,
            )
            .expect("post event")
    }

    /// Bind `referred` to `referrer` through a fresh code.
    pub fn refer(&self, referrer: &str, referred: &str, at: u64) {
        self.with_conn(|conn| {
            let referrer = UserId::from(referrer);
            let code = format!("{}-{}", referrer, referred).to_ascii_uppercase();
            self.resolver
                .register_code(conn, &referrer, &code, at)
                .expect("register code");
            self.resolver
                .bind(conn, &UserId::from(referred), &code, at)
                .expect("bind");
        });
    }

    pub fn set_tiers(&self, tiers: &[ReferralTier]) {
        self.with_conn(|conn| config::replace_tiers(conn, tiers).expect("replace tiers"));
    }

    pub fn add_rule(&self, rule: &ReferralBonusRule) -> RuleId {
        self.with_conn(|conn| config::upsert_rule(conn, rule).expect("upsert rule"))
    }

    /// A creator's balance as seen by the calculator.
    pub fn available(&self, creator: &str) -> Decimal {
        self.balances
            .get_balance(&UserId::from(creator), BASE_TIME)
            .expect("balance")
            .available
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::new()
    }
}

/// An active tier with no flat bonuses.
pub fn tier(level: u32, name: &str, min_referrals: u32, min_commission: Decimal, rate: Decimal) -> ReferralTier {
    ReferralTier {
        tier_level: level,
        tier_name: name.to_string(),
        min_referrals,
        min_commission,
        commission_rate: rate,
        bonus_per_referral: Decimal::ZERO,
        tier_bonus: Decimal::ZERO,
        is_active: true,
    }
}

/// A new (id 0) active flat-bonus rule.
pub fn flat_rule(name: &str, trigger: TriggerCondition, amount: Decimal, recurring: bool) -> ReferralBonusRule {
    ReferralBonusRule {
        id: RuleId(0),
        name: name.to_string(),
        rule_type: BonusRuleType::Milestone,
        trigger,
        bonus_amount: amount,
        bonus_percentage: Decimal::ZERO,
        is_recurring: recurring,
        priority: 0,
        is_active: true,
    }
}
