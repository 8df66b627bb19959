//! Ledger store.
//!
//! Entries are append-only. Every append is validated against the rounding
//! invariant and drops the creator's cached balance in the same
//! transaction, so a cached balance never outlives the entries it summed.

use std::collections::VecDeque;
use std::sync::MutexGuard;

use creatorpay_db::queries::{balances, controls, entries};
use creatorpay_db::{txn, SharedConnection};
use creatorpay_types::ledger::{EntryDraft, EntryStatus, RevenueEntry, RevenueSource};
use creatorpay_types::money::{from_minor_units, is_minor_exact, is_unit_fraction, net_of_share};
use creatorpay_types::{EntryId, UserId};
use rusqlite::Connection;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{LedgerError, Result};

/// Lock the shared connection.
pub(crate) fn lock(conn: &SharedConnection) -> Result<MutexGuard<'_, Connection>> {
    conn.lock().map_err(|_| LedgerError::LockPoisoned)
}

/// Closed predicate for ledger sums.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryFilter {
    /// Sources to include. Empty means every source.
    #[serde(default)]
    pub sources: Vec<RevenueSource>,
    #[serde(default)]
    pub status: Option<EntryStatus>,
}

impl EntryFilter {
    /// Every entry.
    pub fn all() -> Self {
        Self::default()
    }

    /// Every credit, i.e. everything except withdrawals.
    pub fn earnings() -> Self {
        Self {
            sources: RevenueSource::ALL
                .into_iter()
                .filter(|s| !s.is_withdrawal())
                .collect(),
            status: None,
        }
    }

    /// Withdrawal entries only.
    pub fn withdrawals() -> Self {
        Self::sources([RevenueSource::PlatformWithdrawal])
    }

    pub fn sources(sources: impl IntoIterator<Item = RevenueSource>) -> Self {
        Self {
            sources: sources.into_iter().collect(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: EntryStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// Check a draft against the ledger invariants.
///
/// # Errors
///
/// - [`LedgerError::Validation`] if any invariant fails
pub fn validate_draft(draft: &EntryDraft) -> Result<()> {
    let reject = |msg: String| Err(LedgerError::Validation(msg));

    if !is_minor_exact(draft.gross_amount) || !is_minor_exact(draft.net_amount) {
        return reject(format!(
            "amounts must be whole cents, got gross {} net {}",
            draft.gross_amount, draft.net_amount
        ));
    }
    if !is_unit_fraction(draft.platform_share_fraction) {
        return reject(format!(
            "platform share {} is outside [0, 1]",
            draft.platform_share_fraction
        ));
    }
    if draft.source.is_withdrawal() {
        if draft.net_amount >= Decimal::ZERO {
            return reject(format!("withdrawal must be negative, got {}", draft.net_amount));
        }
        if draft.payout_request_id.is_none() || draft.status != EntryStatus::Paid {
            return reject("withdrawal must be paid and linked to a payout request".to_string());
        }
        if draft.reverses_entry_id.is_some() {
            return reject("withdrawals cannot be corrections".to_string());
        }
    } else if draft.reverses_entry_id.is_some() {
        if draft.gross_amount >= Decimal::ZERO || draft.net_amount > Decimal::ZERO {
            return reject(format!(
                "correction must be negative, got gross {} net {}",
                draft.gross_amount, draft.net_amount
            ));
        }
        if draft.memo.as_deref().map_or(true, |m| m.trim().is_empty()) {
            return reject("correction requires a memo".to_string());
        }
        if draft.payout_request_id.is_some() {
            return reject("only withdrawals link to a payout request".to_string());
        }
    } else {
        if draft.gross_amount <= Decimal::ZERO || draft.net_amount < Decimal::ZERO {
            return reject(format!(
                "{} entry must be positive, got gross {} net {}",
                draft.source.as_str(),
                draft.gross_amount,
                draft.net_amount
            ));
        }
        if draft.payout_request_id.is_some() {
            return reject("only withdrawals link to a payout request".to_string());
        }
    }

    let expected = net_of_share(draft.gross_amount, draft.platform_share_fraction)
        .ok_or_else(|| LedgerError::Validation("net amount overflows".to_string()))?;
    if expected != draft.net_amount {
        return reject(format!(
            "net {} does not match gross {} at share {} (expected {expected})",
            draft.net_amount, draft.gross_amount, draft.platform_share_fraction
        ));
    }
    Ok(())
}

/// Validate and append inside the caller's transaction.
pub fn append_in(conn: &Connection, draft: &EntryDraft) -> Result<EntryId> {
    validate_draft(draft)?;
    let id = entries::insert(conn, draft)?;
    balances::invalidate(conn, &draft.creator_id)?;
    tracing::debug!(
        entry_id = id.0,
        creator = %draft.creator_id,
        source = draft.source.as_str(),
        net = %draft.net_amount,
        "ledger entry appended"
    );
    Ok(id)
}

/// Sum of net amounts matching a filter, inside the caller's transaction.
pub fn sum_in(conn: &Connection, creator_id: &UserId, filter: &EntryFilter) -> Result<Decimal> {
    let minor = entries::sum_net_minor(conn, creator_id, &filter.sources, filter.status)?;
    Ok(from_minor_units(minor))
}

/// Handle on the ledger tables over the shared connection.
#[derive(Clone, Debug)]
pub struct LedgerStore {
    conn: SharedConnection,
}

impl LedgerStore {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    /// Append one entry.
    pub fn append(&self, draft: &EntryDraft) -> Result<EntryId> {
        let mut conn = lock(&self.conn)?;
        txn::immediate(&mut conn, |tx| append_in(tx, draft))
    }

    /// Append the entry that cancels `entry_id`, linked back to it.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::Validation`] if the memo is blank, the target is a
    ///   withdrawal or a correction, or the target was already reversed
    /// - [`LedgerError::Db`] with `NotFound` if the target does not exist
    pub fn append_correction(&self, entry_id: EntryId, memo: &str, now: u64) -> Result<RevenueEntry> {
        let memo = memo.trim();
        if memo.is_empty() {
            return Err(LedgerError::Validation("correction requires a memo".to_string()));
        }
        let mut conn = lock(&self.conn)?;
        let correction = txn::immediate(&mut conn, |tx| {
            let original = entries::get(tx, entry_id)?;
            if original.source.is_withdrawal() {
                return Err(LedgerError::Validation(format!(
                    "entry {entry_id} is a withdrawal; payouts are not corrected by hand"
                )));
            }
            if original.is_correction() {
                return Err(LedgerError::Validation(format!(
                    "entry {entry_id} is itself a correction"
                )));
            }
            if let Some(existing) = entries::correction_for(tx, entry_id)? {
                return Err(LedgerError::Validation(format!(
                    "entry {entry_id} already reversed by entry {}",
                    existing.id
                )));
            }
            let id = append_in(tx, &EntryDraft::correction(&original, memo, now))?;
            Ok(entries::get(tx, id)?)
        })?;
        tracing::warn!(
            entry_id = correction.id.0,
            reverses = entry_id.0,
            creator = %correction.creator_id,
            net = %correction.net_amount,
            memo,
            "correction appended"
        );
        Ok(correction)
    }

    pub fn get(&self, id: EntryId) -> Result<RevenueEntry> {
        let conn = lock(&self.conn)?;
        Ok(entries::get(&conn, id)?)
    }

    /// Sum of net amounts for a creator's entries matching `filter`.
    pub fn sum_by_creator(&self, creator_id: &UserId, filter: &EntryFilter) -> Result<Decimal> {
        let conn = lock(&self.conn)?;
        sum_in(&conn, creator_id, filter)
    }

    /// Lazily iterate a creator's entries in `(occurred_at, id)` order.
    pub fn list_by_creator(&self, creator_id: &UserId, since: Option<u64>) -> EntryCursor {
        EntryCursor::new(self.conn.clone(), creator_id.clone(), since)
    }

    /// Anomalies recorded against a creator.
    pub fn anomalies(&self, creator_id: &UserId) -> Result<Vec<controls::AnomalyRow>> {
        let conn = lock(&self.conn)?;
        Ok(controls::anomalies_for(&conn, creator_id)?)
    }

    /// Why a creator is frozen, if they are.
    pub fn frozen_reason(&self, creator_id: &UserId) -> Result<Option<String>> {
        let conn = lock(&self.conn)?;
        Ok(controls::frozen_reason(&conn, creator_id)?)
    }

    /// Manually lift a freeze. Returns `false` if the creator was not frozen.
    pub fn unfreeze(&self, creator_id: &UserId, operator: &str) -> Result<bool> {
        let mut conn = lock(&self.conn)?;
        let lifted = txn::immediate(&mut conn, |tx| {
            let lifted = controls::unfreeze(tx, creator_id)?;
            balances::invalidate(tx, creator_id)?;
            Ok::<_, LedgerError>(lifted)
        })?;
        if lifted {
            tracing::warn!(creator = %creator_id, operator, "creator unfrozen by operator");
        }
        Ok(lifted)
    }
}

/// Restartable, lazily paged iterator over a creator's entries.
///
/// Each page is a fresh keyed query, so entries appended after the cursor's
/// position show up in later pages.
#[derive(Debug)]
pub struct EntryCursor {
    conn: SharedConnection,
    creator_id: UserId,
    since: Option<u64>,
    after: Option<(u64, EntryId)>,
    buffer: VecDeque<RevenueEntry>,
    page_size: u32,
    exhausted: bool,
}

impl EntryCursor {
    /// Entries fetched per storage round-trip.
    pub const DEFAULT_PAGE_SIZE: u32 = 100;

    fn new(conn: SharedConnection, creator_id: UserId, since: Option<u64>) -> Self {
        Self {
            conn,
            creator_id,
            since,
            after: None,
            buffer: VecDeque::new(),
            page_size: Self::DEFAULT_PAGE_SIZE,
            exhausted: false,
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Rewind to the first entry.
    pub fn restart(&mut self) {
        self.after = None;
        self.buffer.clear();
        self.exhausted = false;
    }

    fn fetch_page(&mut self) -> Result<()> {
        let conn = lock(&self.conn)?;
        let page = entries::page_by_creator(
            &conn,
            &self.creator_id,
            self.since,
            self.after,
            self.page_size,
        )?;
        tracing::debug!(
            creator = %self.creator_id,
            fetched = page.len(),
            after = ?self.after,
            "ledger cursor page"
        );
        if (page.len() as u32) < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.after = Some((last.occurred_at, last.id));
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for EntryCursor {
    type Item = Result<RevenueEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
