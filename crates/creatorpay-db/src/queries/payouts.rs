//! Payout request query functions.
//!
//! Status changes go through [`transition`], a compare-and-set on the
//! current status, so a stale caller can never overwrite a newer state.

use creatorpay_types::money::from_minor_units;
use creatorpay_types::payout::{PayoutMethod, PayoutRequest, PayoutStatus};
use creatorpay_types::{RequestId, UserId};
use rust_decimal::Decimal;
use rusqlite::{Connection, OptionalExtension, Row};

use crate::{map_constraint, parse_enum, to_minor, DbError, Result};

const REQUEST_COLUMNS: &str = "id, creator_id, requested_minor, method, method_details, status,
     created_at, decided_at, decided_by, notes, external_reference, processing_since, attempts";

struct RawRequestRow {
    id: i64,
    creator_id: String,
    requested_minor: i64,
    method: String,
    method_details: String,
    status: String,
    created_at: i64,
    decided_at: Option<i64>,
    decided_by: Option<String>,
    notes: Option<String>,
    external_reference: Option<String>,
    processing_since: Option<i64>,
    attempts: i64,
}

fn row_to_request(row: &Row<'_>) -> rusqlite::Result<RawRequestRow> {
    Ok(RawRequestRow {
        id: row.get(0)?,
        creator_id: row.get(1)?,
        requested_minor: row.get(2)?,
        method: row.get(3)?,
        method_details: row.get(4)?,
        status: row.get(5)?,
        created_at: row.get(6)?,
        decided_at: row.get(7)?,
        decided_by: row.get(8)?,
        notes: row.get(9)?,
        external_reference: row.get(10)?,
        processing_since: row.get(11)?,
        attempts: row.get(12)?,
    })
}

impl RawRequestRow {
    fn decode(self) -> Result<PayoutRequest> {
        Ok(PayoutRequest {
            id: RequestId(self.id),
            creator_id: UserId(self.creator_id),
            requested_amount: from_minor_units(self.requested_minor),
            method: parse_enum::<PayoutMethod>(&self.method)?,
            method_details: serde_json::from_str(&self.method_details)
                .map_err(|e| DbError::Serialization(e.to_string()))?,
            status: parse_enum::<PayoutStatus>(&self.status)?,
            created_at: self.created_at as u64,
            decided_at: self.decided_at.map(|t| t as u64),
            decided_by: self.decided_by.map(UserId),
            notes: self.notes,
            external_reference: self.external_reference,
            processing_since: self.processing_since.map(|t| t as u64),
            attempts: u32::try_from(self.attempts).unwrap_or(u32::MAX),
        })
    }
}

fn query_requests(
    conn: &Connection,
    where_clause: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<PayoutRequest>> {
    let sql = format!("SELECT {REQUEST_COLUMNS} FROM payout_requests WHERE {where_clause}");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params, row_to_request)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.into_iter().map(RawRequestRow::decode).collect()
}

/// Insert a new request in `pending`.
///
/// Fails with [`DbError::Constraint`] if the creator already has an active
/// (pending/approved/processing) request.
pub fn insert(
    conn: &Connection,
    creator_id: &UserId,
    amount: Decimal,
    method: PayoutMethod,
    method_details: &serde_json::Value,
    now: u64,
) -> Result<RequestId> {
    let details = serde_json::to_string(method_details)
        .map_err(|e| DbError::Serialization(e.to_string()))?;
    conn.execute(
        "INSERT INTO payout_requests
            (creator_id, requested_minor, method, method_details, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?5)",
        rusqlite::params![
            creator_id.as_str(),
            to_minor(amount)?,
            method.as_str(),
            details,
            now as i64,
        ],
    )
    .map_err(|e| map_constraint(e, "active payout request"))?;
    Ok(RequestId(conn.last_insert_rowid()))
}

/// Fetch a request by id.
pub fn get(conn: &Connection, id: RequestId) -> Result<PayoutRequest> {
    let sql = format!("SELECT {REQUEST_COLUMNS} FROM payout_requests WHERE id = ?1");
    conn.query_row(&sql, [id.0], row_to_request)
        .optional()?
        .ok_or_else(|| DbError::NotFound(format!("payout request {id}")))?
        .decode()
}

/// The creator's pending/approved/processing request, if any.
pub fn active_for_creator(conn: &Connection, creator_id: &UserId) -> Result<Option<PayoutRequest>> {
    let mut found = query_requests(
        conn,
        "creator_id = ?1 AND status IN ('pending', 'approved', 'processing')",
        &[&creator_id.as_str()],
    )?;
    Ok(found.pop())
}

/// All requests of a creator, newest first.
pub fn list_for_creator(conn: &Connection, creator_id: &UserId) -> Result<Vec<PayoutRequest>> {
    query_requests(
        conn,
        "creator_id = ?1 ORDER BY created_at DESC, id DESC",
        &[&creator_id.as_str()],
    )
}

/// All requests in a status, oldest first (the admin queue).
pub fn list_by_status(conn: &Connection, status: PayoutStatus) -> Result<Vec<PayoutRequest>> {
    query_requests(
        conn,
        "status = ?1 ORDER BY created_at ASC, id ASC",
        &[&status.as_str()],
    )
}

/// Requests that entered `processing` at or before `cutoff`.
pub fn processing_since_before(conn: &Connection, cutoff: u64) -> Result<Vec<PayoutRequest>> {
    query_requests(
        conn,
        "status = 'processing' AND processing_since <= ?1 ORDER BY processing_since ASC",
        &[&(cutoff as i64)],
    )
}

/// Compare-and-set the status of a request.
///
/// Fails with [`DbError::Constraint`] if the request is no longer in `from`.
pub fn transition(
    conn: &Connection,
    id: RequestId,
    from: PayoutStatus,
    to: PayoutStatus,
    now: u64,
) -> Result<()> {
    let updated = conn.execute(
        "UPDATE payout_requests SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
        rusqlite::params![to.as_str(), now as i64, id.0, from.as_str()],
    )
    .map_err(|e| map_constraint(e, "payout status"))?;
    if updated == 0 {
        return Err(DbError::Constraint(format!(
            "payout request {id} is not in status {}",
            from.as_str()
        )));
    }
    Ok(())
}

/// Record who decided a request and when.
pub fn record_decision(
    conn: &Connection,
    id: RequestId,
    decided_by: &UserId,
    now: u64,
) -> Result<()> {
    conn.execute(
        "UPDATE payout_requests SET decided_at = ?1, decided_by = ?2 WHERE id = ?3",
        rusqlite::params![now as i64, decided_by.as_str(), id.0],
    )?;
    Ok(())
}

/// Append a line to the request's notes.
pub fn append_note(conn: &Connection, id: RequestId, note: &str) -> Result<()> {
    conn.execute(
        "UPDATE payout_requests
         SET notes = CASE WHEN notes IS NULL OR notes = '' THEN ?1 ELSE notes || char(10) || ?1 END
         WHERE id = ?2",
        rusqlite::params![note, id.0],
    )?;
    Ok(())
}

/// Mark the start of a dispatch attempt.
pub fn begin_processing(conn: &Connection, id: RequestId, now: u64) -> Result<()> {
    conn.execute(
        "UPDATE payout_requests SET processing_since = ?1, attempts = attempts + 1 WHERE id = ?2",
        rusqlite::params![now as i64, id.0],
    )?;
    Ok(())
}

/// Store the payment collaborator's reference for the current attempt.
pub fn set_external_reference(conn: &Connection, id: RequestId, reference: &str) -> Result<()> {
    conn.execute(
        "UPDATE payout_requests SET external_reference = ?1 WHERE id = ?2",
        rusqlite::params![reference, id.0],
    )?;
    Ok(())
}

/// Clear processing markers when a request leaves `processing`.
pub fn end_processing(conn: &Connection, id: RequestId) -> Result<()> {
    conn.execute(
        "UPDATE payout_requests SET processing_since = NULL WHERE id = ?1",
        [id.0],
    )?;
    Ok(())
}

/// A payout audit trail row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRow {
    pub request_id: RequestId,
    pub from_status: Option<PayoutStatus>,
    pub to_status: PayoutStatus,
    pub actor: String,
    pub note: Option<String>,
    pub at: u64,
}

/// Append an audit record for a status change.
pub fn insert_audit(conn: &Connection, row: &AuditRow) -> Result<()> {
    conn.execute(
        "INSERT INTO payout_audit (request_id, from_status, to_status, actor, note, at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            row.request_id.0,
            row.from_status.map(|s| s.as_str()),
            row.to_status.as_str(),
            row.actor,
            row.note,
            row.at as i64,
        ],
    )?;
    Ok(())
}

/// Audit trail of a request in insertion order.
pub fn audit_trail(conn: &Connection, id: RequestId) -> Result<Vec<AuditRow>> {
    let mut stmt = conn.prepare(
        "SELECT from_status, to_status, actor, note, at FROM payout_audit
         WHERE request_id = ?1 ORDER BY id ASC",
    )?;
    let raw = stmt
        .query_map([id.0], |row| {
            Ok((
                row.get::<_, Option<String>>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    raw.into_iter()
        .map(|(from, to, actor, note, at)| {
            Ok(AuditRow {
                request_id: id,
                from_status: from.as_deref().map(parse_enum::<PayoutStatus>).transpose()?,
                to_status: parse_enum::<PayoutStatus>(&to)?,
                actor,
                note,
                at: at as u64,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn test_db() -> Connection {
        crate::open_memory().expect("open test db")
    }

    fn details() -> serde_json::Value {
        serde_json::json!({"iban": "DE89370400440532013000"})
    }

    #[test]
    fn test_insert_and_get() {
        let conn = test_db();
        let creator = UserId::from("c1");
        let id = insert(&conn, &creator, dec!(25.50), PayoutMethod::BankTransfer, &details(), 100)
            .expect("insert");
        let req = get(&conn, id).expect("get");
        assert_eq!(req.requested_amount, dec!(25.50));
        assert_eq!(req.status, PayoutStatus::Pending);
        assert_eq!(req.method_details, details());
        assert_eq!(req.attempts, 0);
    }

    #[test]
    fn test_one_active_request_per_creator() {
        let conn = test_db();
        let creator = UserId::from("c1");
        let first = insert(&conn, &creator, dec!(10), PayoutMethod::Paypal, &details(), 100)
            .expect("first");
        let second = insert(&conn, &creator, dec!(10), PayoutMethod::Paypal, &details(), 101);
        assert!(matches!(second, Err(DbError::Constraint(_))));

        // Another creator is unaffected.
        insert(&conn, &UserId::from("c2"), dec!(10), PayoutMethod::Paypal, &details(), 101)
            .expect("other creator");

        // Once terminal, a new request is allowed.
        transition(&conn, first, PayoutStatus::Pending, PayoutStatus::Cancelled, 102)
            .expect("cancel");
        insert(&conn, &creator, dec!(10), PayoutMethod::Paypal, &details(), 103)
            .expect("after cancel");
    }

    #[test]
    fn test_transition_is_compare_and_set() {
        let conn = test_db();
        let id = insert(&conn, &UserId::from("c1"), dec!(10), PayoutMethod::Stripe, &details(), 1)
            .expect("insert");
        transition(&conn, id, PayoutStatus::Pending, PayoutStatus::Approved, 2).expect("approve");
        let stale = transition(&conn, id, PayoutStatus::Pending, PayoutStatus::Rejected, 3);
        assert!(matches!(stale, Err(DbError::Constraint(_))));
        assert_eq!(get(&conn, id).expect("get").status, PayoutStatus::Approved);
    }

    #[test]
    fn test_notes_and_processing_markers() {
        let conn = test_db();
        let id = insert(&conn, &UserId::from("c1"), dec!(10), PayoutMethod::Stripe, &details(), 1)
            .expect("insert");
        append_note(&conn, id, "first").expect("note");
        append_note(&conn, id, "second").expect("note");
        begin_processing(&conn, id, 50).expect("begin");
        set_external_reference(&conn, id, "tr_123").expect("ref");

        let req = get(&conn, id).expect("get");
        assert_eq!(req.notes.as_deref(), Some("first\nsecond"));
        assert_eq!(req.processing_since, Some(50));
        assert_eq!(req.attempts, 1);
        assert_eq!(req.external_reference.as_deref(), Some("tr_123"));

        end_processing(&conn, id).expect("end");
        assert_eq!(get(&conn, id).expect("get").processing_since, None);
    }

    #[test]
    fn test_audit_trail() {
        let conn = test_db();
        let id = insert(&conn, &UserId::from("c1"), dec!(10), PayoutMethod::Stripe, &details(), 1)
            .expect("insert");
        insert_audit(
            &conn,
            &AuditRow {
                request_id: id,
                from_status: None,
                to_status: PayoutStatus::Pending,
                actor: "c1".into(),
                note: None,
                at: 1,
            },
        )
        .expect("audit");
        insert_audit(
            &conn,
            &AuditRow {
                request_id: id,
                from_status: Some(PayoutStatus::Pending),
                to_status: PayoutStatus::Rejected,
                actor: "admin".into(),
                note: Some("duplicate account".into()),
                at: 2,
            },
        )
        .expect("audit");

        let trail = audit_trail(&conn, id).expect("trail");
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[1].from_status, Some(PayoutStatus::Pending));
        assert_eq!(trail[1].note.as_deref(), Some("duplicate account"));
    }

    #[test]
    fn test_processing_since_before() {
        let conn = test_db();
        let id = insert(&conn, &UserId::from("c1"), dec!(10), PayoutMethod::Stripe, &details(), 1)
            .expect("insert");
        transition(&conn, id, PayoutStatus::Pending, PayoutStatus::Approved, 2).expect("approve");
        transition(&conn, id, PayoutStatus::Approved, PayoutStatus::Processing, 3).expect("process");
        begin_processing(&conn, id, 3).expect("begin");

        assert!(processing_since_before(&conn, 2).expect("query").is_empty());
        assert_eq!(processing_since_before(&conn, 3).expect("query").len(), 1);
    }
}
