//! Balance calculator and reconciliation.
//!
//! A balance is derived from the ledger, never stored as a source of truth:
//!
//! - `total_earnings` = Σ net over every non-withdrawal entry
//! - `total_payouts`  = Σ |net| over paid withdrawal entries
//! - `available`      = `total_earnings − total_payouts`
//!
//! Results are cached in `balance_cache`. Appends delete the cached row, so
//! a present row always matches the ledger unless something wrote to the
//! tables behind the engine's back. [`BalanceCalculator::reconcile`] checks
//! exactly that.

use std::collections::BTreeSet;

use creatorpay_db::queries::balances::{self, CachedBalance};
use creatorpay_db::queries::{controls, entries};
use creatorpay_db::{to_minor, txn, SharedConnection};
use creatorpay_types::ledger::RevenueEntry;
use creatorpay_types::money::{from_minor_units, net_of_share};
use creatorpay_types::payout::Balance;
use creatorpay_types::UserId;
use rusqlite::Connection;
use serde::Serialize;

use crate::store::lock;
use crate::{LedgerError, Result};

/// Entries checked per page during reconciliation.
const RECONCILE_PAGE: u32 = 500;

/// Recompute a balance from the ledger, ignoring the cache.
pub fn compute_in(conn: &Connection, creator_id: &UserId) -> Result<Balance> {
    let earnings = entries::earnings_minor(conn, creator_id)?;
    let payouts = entries::paid_withdrawals_minor(conn, creator_id)?;
    Ok(Balance::new(
        from_minor_units(earnings),
        from_minor_units(payouts),
    ))
}

/// Cached balance if present, else recompute and cache. Runs inside the
/// caller's transaction.
pub fn balance_in(conn: &Connection, creator_id: &UserId, now: u64) -> Result<Balance> {
    if let Some(cached) = balances::get(conn, creator_id)? {
        return Ok(Balance::new(
            from_minor_units(cached.total_earnings_minor),
            from_minor_units(cached.total_payouts_minor),
        ));
    }
    let balance = compute_in(conn, creator_id)?;
    balances::put(conn, creator_id, &to_cached(&balance, now)?)?;
    Ok(balance)
}

fn to_cached(balance: &Balance, now: u64) -> Result<CachedBalance> {
    Ok(CachedBalance {
        total_earnings_minor: to_minor(balance.total_earnings)?,
        total_payouts_minor: to_minor(balance.total_payouts)?,
        computed_at: now,
    })
}

/// Outcome of [`BalanceCalculator::reconcile_all`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub checked: usize,
    /// Creators found inconsistent and frozen by this run.
    pub frozen: Vec<UserId>,
}

enum Verdict {
    Consistent(Balance),
    Inconsistent(String),
}

/// Balance reads and reconciliation over the shared connection.
#[derive(Clone, Debug)]
pub struct BalanceCalculator {
    conn: SharedConnection,
}

impl BalanceCalculator {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    /// The creator's balance, from a single consistent snapshot. A cache
    /// row filled by this read is stamped with `now`.
    pub fn get_balance(&self, creator_id: &UserId, now: u64) -> Result<Balance> {
        let mut conn = lock(&self.conn)?;
        txn::deferred(&mut conn, |tx| balance_in(tx, creator_id, now))
    }

    /// Compare the cache and every entry against a fresh recomputation.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::LedgerInconsistency`] on any mismatch; the anomaly
    ///   and the freeze are committed before the error is returned
    pub fn reconcile(&self, creator_id: &UserId, now: u64) -> Result<Balance> {
        let mut conn = lock(&self.conn)?;
        let verdict = txn::immediate(&mut conn, |tx| reconcile_in(tx, creator_id, now))?;
        match verdict {
            Verdict::Consistent(balance) => Ok(balance),
            Verdict::Inconsistent(detail) => Err(LedgerError::LedgerInconsistency {
                creator_id: creator_id.clone(),
                detail,
            }),
        }
    }

    /// Reconcile every creator that has entries or a cached balance.
    pub fn reconcile_all(&self, now: u64) -> Result<ReconcileReport> {
        let creators: BTreeSet<UserId> = {
            let conn = lock(&self.conn)?;
            let mut all: BTreeSet<UserId> = entries::creators(&conn)?.into_iter().collect();
            all.extend(balances::cached_creators(&conn)?);
            all
        };

        let mut report = ReconcileReport::default();
        for creator_id in creators {
            report.checked += 1;
            match self.reconcile(&creator_id, now) {
                Ok(_) => {}
                Err(LedgerError::LedgerInconsistency { .. }) => report.frozen.push(creator_id),
                Err(e) => return Err(e),
            }
        }
        tracing::info!(
            checked = report.checked,
            frozen = report.frozen.len(),
            "ledger reconciliation finished"
        );
        Ok(report)
    }
}

fn reconcile_in(conn: &Connection, creator_id: &UserId, now: u64) -> Result<Verdict> {
    let fresh = compute_in(conn, creator_id)?;
    let mut problems = Vec::new();

    if let Some(cached) = balances::get(conn, creator_id)? {
        let expected = to_cached(&fresh, cached.computed_at)?;
        if cached != expected {
            problems.push(format!(
                "cached earnings/payouts {}/{} but ledger says {}/{}",
                from_minor_units(cached.total_earnings_minor),
                from_minor_units(cached.total_payouts_minor),
                fresh.total_earnings,
                fresh.total_payouts
            ));
        }
    }

    let mut after = None;
    loop {
        let page = entries::page_by_creator(conn, creator_id, None, after, RECONCILE_PAGE)?;
        for entry in &page {
            if let Some(problem) = entry_problem(entry) {
                problems.push(problem);
            }
        }
        match page.last() {
            Some(last) if page.len() as u32 == RECONCILE_PAGE => {
                after = Some((last.occurred_at, last.id));
            }
            _ => break,
        }
    }

    if problems.is_empty() {
        balances::put(conn, creator_id, &to_cached(&fresh, now)?)?;
        return Ok(Verdict::Consistent(fresh));
    }

    let detail = problems.join("; ");
    controls::insert_anomaly(
        conn,
        &controls::AnomalyRow {
            creator_id: creator_id.clone(),
            kind: "balance_mismatch".to_string(),
            detail: detail.clone(),
            amount_minor: to_minor(fresh.available)?,
            at: now,
        },
    )?;
    controls::freeze(conn, creator_id, &detail, now)?;
    balances::invalidate(conn, creator_id)?;
    tracing::error!(creator = %creator_id, %detail, "ledger inconsistency, creator frozen");
    Ok(Verdict::Inconsistent(detail))
}

fn entry_problem(entry: &RevenueEntry) -> Option<String> {
    match net_of_share(entry.gross_amount, entry.platform_share_fraction) {
        Some(expected) if expected == entry.net_amount => None,
        _ => Some(format!(
            "entry {} net {} violates gross {} at share {}",
            entry.id, entry.net_amount, entry.gross_amount, entry.platform_share_fraction
        )),
    }
}
