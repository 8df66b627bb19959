//! Ledger entry query functions.
//!
//! Rows in `revenue_entries` are only ever inserted; the single permitted
//! update is `status pending -> paid` (enforced by trigger).

use creatorpay_types::ledger::{EntryDraft, EntryStatus, RevenueEntry, RevenueSource};
use creatorpay_types::money::from_minor_units;
use creatorpay_types::{EntryId, RequestId, UserId};
use rusqlite::{Connection, OptionalExtension, Row};

use crate::{map_constraint, parse_decimal, parse_enum, to_minor, DbError, Result};

const ENTRY_COLUMNS: &str = "id, creator_id, source, gross_minor, platform_share, net_minor,
     status, occurred_at, payout_request_id, reverses_entry_id, memo";

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<RawEntryRow> {
    Ok(RawEntryRow {
        id: row.get(0)?,
        creator_id: row.get(1)?,
        source: row.get(2)?,
        gross_minor: row.get(3)?,
        platform_share: row.get(4)?,
        net_minor: row.get(5)?,
        status: row.get(6)?,
        occurred_at: row.get(7)?,
        payout_request_id: row.get(8)?,
        reverses_entry_id: row.get(9)?,
        memo: row.get(10)?,
    })
}

/// A raw `revenue_entries` row, before enum/decimal decoding.
struct RawEntryRow {
    id: i64,
    creator_id: String,
    source: String,
    gross_minor: i64,
    platform_share: String,
    net_minor: i64,
    status: String,
    occurred_at: i64,
    payout_request_id: Option<i64>,
    reverses_entry_id: Option<i64>,
    memo: Option<String>,
}

impl RawEntryRow {
    fn decode(self) -> Result<RevenueEntry> {
        Ok(RevenueEntry {
            id: EntryId(self.id),
            creator_id: UserId(self.creator_id),
            source: parse_enum::<RevenueSource>(&self.source)?,
            gross_amount: from_minor_units(self.gross_minor),
            platform_share_fraction: parse_decimal(&self.platform_share)?,
            net_amount: from_minor_units(self.net_minor),
            status: parse_enum::<EntryStatus>(&self.status)?,
            occurred_at: self.occurred_at as u64,
            payout_request_id: self.payout_request_id.map(RequestId),
            reverses_entry_id: self.reverses_entry_id.map(EntryId),
            memo: self.memo,
        })
    }
}

/// Insert a ledger entry. The caller has already validated the draft.
pub fn insert(conn: &Connection, draft: &EntryDraft) -> Result<EntryId> {
    conn.execute(
        "INSERT INTO revenue_entries
            (creator_id, source, gross_minor, platform_share, net_minor, status,
             occurred_at, payout_request_id, reverses_entry_id, memo)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        rusqlite::params![
            draft.creator_id.as_str(),
            draft.source.as_str(),
            to_minor(draft.gross_amount)?,
            draft.platform_share_fraction.normalize().to_string(),
            to_minor(draft.net_amount)?,
            draft.status.as_str(),
            draft.occurred_at as i64,
            draft.payout_request_id.map(|r| r.0),
            draft.reverses_entry_id.map(|e| e.0),
            draft.memo,
        ],
    )
    .map_err(|e| map_constraint(e, "revenue entry"))?;
    Ok(EntryId(conn.last_insert_rowid()))
}

/// Fetch a single entry by id.
pub fn get(conn: &Connection, id: EntryId) -> Result<RevenueEntry> {
    let sql = format!("SELECT {ENTRY_COLUMNS} FROM revenue_entries WHERE id = ?1");
    conn.query_row(&sql, [id.0], row_to_entry)
        .optional()?
        .ok_or_else(|| DbError::NotFound(format!("revenue entry {id}")))?
        .decode()
}

/// One page of a creator's entries ordered by `(occurred_at, id)` ascending.
///
/// * `since` - Only entries with `occurred_at >= since`
/// * `after` - Keyset cursor: only entries strictly after `(occurred_at, id)`
pub fn page_by_creator(
    conn: &Connection,
    creator_id: &UserId,
    since: Option<u64>,
    after: Option<(u64, EntryId)>,
    limit: u32,
) -> Result<Vec<RevenueEntry>> {
    let since = since.unwrap_or(0) as i64;
    let (after_ts, after_id) = after
        .map(|(ts, id)| (ts as i64, id.0))
        .unwrap_or((i64::MIN, i64::MIN));

    let sql = format!(
        "SELECT {ENTRY_COLUMNS} FROM revenue_entries
         WHERE creator_id = ?1 AND occurred_at >= ?2
           AND (occurred_at > ?3 OR (occurred_at = ?3 AND id > ?4))
         ORDER BY occurred_at ASC, id ASC
         LIMIT ?5"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            rusqlite::params![creator_id.as_str(), since, after_ts, after_id, limit],
            row_to_entry,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter().map(RawEntryRow::decode).collect()
}

/// Sum of `net_minor` for a creator, restricted to the given sources and,
/// optionally, a status. An empty source list matches every source.
pub fn sum_net_minor(
    conn: &Connection,
    creator_id: &UserId,
    sources: &[RevenueSource],
    status: Option<EntryStatus>,
) -> Result<i64> {
    let mut sql = String::from(
        "SELECT COALESCE(SUM(net_minor), 0) FROM revenue_entries WHERE creator_id = ?1",
    );
    let mut params: Vec<String> = vec![creator_id.as_str().to_string()];

    if !sources.is_empty() {
        let placeholders: Vec<String> = sources
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", i + 2))
            .collect();
        sql.push_str(&format!(" AND source IN ({})", placeholders.join(", ")));
        params.extend(sources.iter().map(|s| s.as_str().to_string()));
    }
    if let Some(status) = status {
        sql.push_str(&format!(" AND status = ?{}", params.len() + 1));
        params.push(status.as_str().to_string());
    }

    let total: i64 = conn.query_row(&sql, rusqlite::params_from_iter(params.iter()), |row| {
        row.get(0)
    })?;
    Ok(total)
}

/// Sum of all non-withdrawal credits for a creator, in minor units.
pub fn earnings_minor(conn: &Connection, creator_id: &UserId) -> Result<i64> {
    let total: i64 = conn.query_row(
        "SELECT COALESCE(SUM(net_minor), 0) FROM revenue_entries
         WHERE creator_id = ?1 AND source != 'platform_withdrawal'",
        [creator_id.as_str()],
        |row| row.get(0),
    )?;
    Ok(total)
}

/// Sum of `|net|` over paid withdrawals for a creator, in minor units.
pub fn paid_withdrawals_minor(conn: &Connection, creator_id: &UserId) -> Result<i64> {
    let total: i64 = conn.query_row(
        "SELECT COALESCE(SUM(ABS(net_minor)), 0) FROM revenue_entries
         WHERE creator_id = ?1 AND source = 'platform_withdrawal' AND status = 'paid'",
        [creator_id.as_str()],
        |row| row.get(0),
    )?;
    Ok(total)
}

/// The withdrawal entry linked to a payout request, if any.
pub fn withdrawal_for_request(
    conn: &Connection,
    request_id: RequestId,
) -> Result<Option<RevenueEntry>> {
    let sql = format!("SELECT {ENTRY_COLUMNS} FROM revenue_entries WHERE payout_request_id = ?1");
    conn.query_row(&sql, [request_id.0], row_to_entry)
        .optional()?
        .map(RawEntryRow::decode)
        .transpose()
}

/// The correction that offsets `entry_id`, if one was appended.
pub fn correction_for(conn: &Connection, entry_id: EntryId) -> Result<Option<RevenueEntry>> {
    let sql = format!("SELECT {ENTRY_COLUMNS} FROM revenue_entries WHERE reverses_entry_id = ?1");
    conn.query_row(&sql, [entry_id.0], row_to_entry)
        .optional()?
        .map(RawEntryRow::decode)
        .transpose()
}

/// Flip pending earnings to `paid`, oldest first, while the running total
/// of earnings stays within `covered_minor`. Returns the number flipped.
pub fn mark_paid_through(conn: &Connection, creator_id: &UserId, covered_minor: i64) -> Result<usize> {
    let mut stmt = conn.prepare(
        "SELECT id, net_minor, status FROM revenue_entries
         WHERE creator_id = ?1 AND source != 'platform_withdrawal'
         ORDER BY occurred_at ASC, id ASC",
    )?;
    let rows = stmt
        .query_map([creator_id.as_str()], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut running: i64 = 0;
    let mut to_flip = Vec::new();
    for (id, net, status) in rows {
        running = running.saturating_add(net);
        if running > covered_minor {
            break;
        }
        if status == EntryStatus::Pending.as_str() {
            to_flip.push(id);
        }
    }

    let mut update =
        conn.prepare("UPDATE revenue_entries SET status = 'paid' WHERE id = ?1 AND status = 'pending'")?;
    let mut flipped = 0;
    for id in to_flip {
        flipped += update.execute([id])?;
    }
    Ok(flipped)
}

/// Every creator that has at least one ledger entry.
pub fn creators(conn: &Connection) -> Result<Vec<UserId>> {
    let mut stmt = conn.prepare("SELECT DISTINCT creator_id FROM revenue_entries ORDER BY creator_id")?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids.into_iter().map(UserId).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn test_db() -> Connection {
        crate::open_memory().expect("open test db")
    }

    fn tip(creator: &str, gross: rust_decimal::Decimal, at: u64) -> EntryDraft {
        EntryDraft::earning(UserId::from(creator), RevenueSource::Tip, gross, dec!(0.10), at)
            .expect("draft")
    }

    #[test]
    fn test_insert_and_get() {
        let conn = test_db();
        let id = insert(&conn, &tip("c1", dec!(100), 10)).expect("insert");
        let entry = get(&conn, id).expect("get");
        assert_eq!(entry.net_amount, dec!(90.00));
        assert_eq!(entry.platform_share_fraction, dec!(0.1));
        assert_eq!(entry.status, EntryStatus::Pending);
    }

    #[test]
    fn test_entries_cannot_be_deleted_or_rewritten() {
        let conn = test_db();
        let id = insert(&conn, &tip("c1", dec!(10), 10)).expect("insert");
        assert!(conn
            .execute("DELETE FROM revenue_entries WHERE id = ?1", [id.0])
            .is_err());
        assert!(conn
            .execute("UPDATE revenue_entries SET net_minor = 1 WHERE id = ?1", [id.0])
            .is_err());
        conn.execute("UPDATE revenue_entries SET status = 'paid' WHERE id = ?1", [id.0])
            .expect("pending -> paid is allowed");
        assert!(conn
            .execute("UPDATE revenue_entries SET status = 'pending' WHERE id = ?1", [id.0])
            .is_err());
    }

    #[test]
    fn test_paging_is_ordered_by_time() {
        let conn = test_db();
        insert(&conn, &tip("c1", dec!(3), 30)).expect("insert");
        insert(&conn, &tip("c1", dec!(1), 10)).expect("insert");
        insert(&conn, &tip("c1", dec!(2), 20)).expect("insert");
        insert(&conn, &tip("c2", dec!(9), 15)).expect("insert");

        let first = page_by_creator(&conn, &UserId::from("c1"), None, None, 2).expect("page");
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].occurred_at, 10);
        assert_eq!(first[1].occurred_at, 20);

        let last = first.last().map(|e| (e.occurred_at, e.id));
        let second = page_by_creator(&conn, &UserId::from("c1"), None, last, 2).expect("page");
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].occurred_at, 30);

        let since = page_by_creator(&conn, &UserId::from("c1"), Some(20), None, 10).expect("page");
        assert_eq!(since.len(), 2);
    }

    #[test]
    fn test_sums() {
        let conn = test_db();
        let creator = UserId::from("c1");
        insert(&conn, &tip("c1", dec!(100), 10)).expect("insert");
        insert(
            &conn,
            &EntryDraft::earning(creator.clone(), RevenueSource::Ad, dec!(10), dec!(0.35), 11)
                .expect("draft"),
        )
        .expect("insert");

        assert_eq!(earnings_minor(&conn, &creator).expect("sum"), 9000 + 650);
        assert_eq!(
            sum_net_minor(&conn, &creator, &[RevenueSource::Ad], None).expect("sum"),
            650
        );
        assert_eq!(
            sum_net_minor(&conn, &creator, &[], Some(EntryStatus::Paid)).expect("sum"),
            0
        );
        assert_eq!(paid_withdrawals_minor(&conn, &creator).expect("sum"), 0);
    }

    #[test]
    fn test_mark_paid_through_is_fifo() {
        let conn = test_db();
        let creator = UserId::from("c1");
        let a = insert(&conn, &tip("c1", dec!(10), 10)).expect("insert"); // 9.00
        let b = insert(&conn, &tip("c1", dec!(10), 20)).expect("insert"); // 9.00
        let c = insert(&conn, &tip("c1", dec!(10), 30)).expect("insert"); // 9.00

        let flipped = mark_paid_through(&conn, &creator, 1800).expect("mark");
        assert_eq!(flipped, 2);
        assert_eq!(get(&conn, a).expect("get").status, EntryStatus::Paid);
        assert_eq!(get(&conn, b).expect("get").status, EntryStatus::Paid);
        assert_eq!(get(&conn, c).expect("get").status, EntryStatus::Pending);
    }

    #[test]
    fn test_one_correction_per_entry() {
        let conn = test_db();
        let creator = UserId::from("c1");
        let id = insert(&conn, &tip("c1", dec!(10), 10)).expect("insert");
        let original = get(&conn, id).expect("get");
        assert!(correction_for(&conn, id).expect("lookup").is_none());

        let fix = insert(&conn, &EntryDraft::correction(&original, "refund", 20)).expect("insert");
        let found = correction_for(&conn, id).expect("lookup").expect("correction");
        assert_eq!(found.id, fix);
        assert_eq!(found.reverses_entry_id, Some(id));
        assert_eq!(found.net_amount, dec!(-9.00));
        assert_eq!(earnings_minor(&conn, &creator).expect("sum"), 0);

        let again = insert(&conn, &EntryDraft::correction(&original, "refund", 30));
        assert!(matches!(again, Err(DbError::Constraint(_))));
    }
}
