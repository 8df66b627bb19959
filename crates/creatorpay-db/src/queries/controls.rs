//! Ledger anomalies and creator freezes.
//!
//! An anomaly is an auditable record of money that did not flow the usual
//! way (e.g. a referral share retained because the referrer is gone). A
//! freeze halts payouts for a creator until an operator clears it by hand;
//! earnings keep accruing.

use creatorpay_types::UserId;
use rusqlite::{Connection, OptionalExtension};

use crate::Result;

/// A recorded ledger anomaly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnomalyRow {
    pub creator_id: UserId,
    pub kind: String,
    pub detail: String,
    pub amount_minor: i64,
    pub at: u64,
}

/// Record an anomaly.
pub fn insert_anomaly(conn: &Connection, row: &AnomalyRow) -> Result<()> {
    conn.execute(
        "INSERT INTO ledger_anomalies (creator_id, kind, detail, amount_minor, at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            row.creator_id.as_str(),
            row.kind,
            row.detail,
            row.amount_minor,
            row.at as i64,
        ],
    )?;
    Ok(())
}

/// Anomalies recorded for a creator, oldest first.
pub fn anomalies_for(conn: &Connection, creator_id: &UserId) -> Result<Vec<AnomalyRow>> {
    let mut stmt = conn.prepare(
        "SELECT creator_id, kind, detail, amount_minor, at FROM ledger_anomalies
         WHERE creator_id = ?1 ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map([creator_id.as_str()], |row| {
            Ok(AnomalyRow {
                creator_id: UserId(row.get(0)?),
                kind: row.get(1)?,
                detail: row.get(2)?,
                amount_minor: row.get(3)?,
                at: row.get::<_, i64>(4)? as u64,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Freeze a creator. Keeps the original reason if already frozen.
pub fn freeze(conn: &Connection, creator_id: &UserId, reason: &str, now: u64) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO frozen_creators (creator_id, reason, frozen_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![creator_id.as_str(), reason, now as i64],
    )?;
    Ok(())
}

/// Clear a freeze. Returns `true` if the creator was frozen.
pub fn unfreeze(conn: &Connection, creator_id: &UserId) -> Result<bool> {
    let removed = conn.execute(
        "DELETE FROM frozen_creators WHERE creator_id = ?1",
        [creator_id.as_str()],
    )?;
    Ok(removed == 1)
}

/// The freeze reason, if the creator is frozen.
pub fn frozen_reason(conn: &Connection, creator_id: &UserId) -> Result<Option<String>> {
    let reason = conn
        .query_row(
            "SELECT reason FROM frozen_creators WHERE creator_id = ?1",
            [creator_id.as_str()],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anomalies() {
        let conn = crate::open_memory().expect("open");
        let creator = UserId::from("c1");
        insert_anomaly(
            &conn,
            &AnomalyRow {
                creator_id: creator.clone(),
                kind: "referrer_inactive".into(),
                detail: "referrer r9 is inactive".into(),
                amount_minor: 150,
                at: 5,
            },
        )
        .expect("insert");
        let rows = anomalies_for(&conn, &creator).expect("list");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].amount_minor, 150);
    }

    #[test]
    fn test_freeze_cycle() {
        let conn = crate::open_memory().expect("open");
        let creator = UserId::from("c1");
        assert_eq!(frozen_reason(&conn, &creator).expect("reason"), None);
        freeze(&conn, &creator, "cache mismatch", 1).expect("freeze");
        freeze(&conn, &creator, "second reason", 2).expect("freeze again");
        assert_eq!(
            frozen_reason(&conn, &creator).expect("reason").as_deref(),
            Some("cache mismatch")
        );
        assert!(unfreeze(&conn, &creator).expect("unfreeze"));
        assert!(!unfreeze(&conn, &creator).expect("unfreeze"));
    }
}
