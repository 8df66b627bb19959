//! Balance cache query functions.
//!
//! The cache is invalidate-on-write: every ledger append for a creator
//! deletes that creator's row, and the next read repopulates it.

use creatorpay_types::UserId;
use rusqlite::{Connection, OptionalExtension};

use crate::Result;

/// A cached balance row, in minor units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedBalance {
    pub total_earnings_minor: i64,
    pub total_payouts_minor: i64,
    pub computed_at: u64,
}

/// Read the cached balance for a creator.
pub fn get(conn: &Connection, creator_id: &UserId) -> Result<Option<CachedBalance>> {
    let row = conn
        .query_row(
            "SELECT total_earnings_minor, total_payouts_minor, computed_at
             FROM balance_cache WHERE creator_id = ?1",
            [creator_id.as_str()],
            |row| {
                Ok(CachedBalance {
                    total_earnings_minor: row.get(0)?,
                    total_payouts_minor: row.get(1)?,
                    computed_at: row.get::<_, i64>(2)? as u64,
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Store a freshly computed balance.
pub fn put(conn: &Connection, creator_id: &UserId, balance: &CachedBalance) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO balance_cache
            (creator_id, total_earnings_minor, total_payouts_minor, computed_at)
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![
            creator_id.as_str(),
            balance.total_earnings_minor,
            balance.total_payouts_minor,
            balance.computed_at as i64,
        ],
    )?;
    Ok(())
}

/// Drop a creator's cached balance.
pub fn invalidate(conn: &Connection, creator_id: &UserId) -> Result<()> {
    conn.execute(
        "DELETE FROM balance_cache WHERE creator_id = ?1",
        [creator_id.as_str()],
    )?;
    Ok(())
}

/// Creators that currently have a cached balance.
pub fn cached_creators(conn: &Connection) -> Result<Vec<UserId>> {
    let mut stmt = conn.prepare("SELECT creator_id FROM balance_cache ORDER BY creator_id")?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids.into_iter().map(UserId).collect())
}
