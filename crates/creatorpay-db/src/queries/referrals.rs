//! Referral codes, bindings and account liveness.

use creatorpay_types::UserId;
use rusqlite::{Connection, OptionalExtension};

use crate::{map_constraint, DbError, Result};

/// A referral binding row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingRow {
    pub referred_user_id: UserId,
    pub referrer_id: UserId,
    pub code: String,
    pub bound_at: u64,
    pub qualified: bool,
}

/// Register a referral code for a referrer.
pub fn insert_code(conn: &Connection, code: &str, referrer_id: &UserId, now: u64) -> Result<()> {
    conn.execute(
        "INSERT INTO referral_codes (code, referrer_id, created_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![code, referrer_id.as_str(), now as i64],
    )
    .map_err(|e| map_constraint(e, "referral code"))?;
    Ok(())
}

/// Look up the owner of a referral code.
pub fn code_owner(conn: &Connection, code: &str) -> Result<Option<UserId>> {
    let owner = conn
        .query_row(
            "SELECT referrer_id FROM referral_codes WHERE code = ?1",
            [code],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(owner.map(UserId))
}

/// Codes owned by a referrer.
pub fn codes_for(conn: &Connection, referrer_id: &UserId) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT code FROM referral_codes WHERE referrer_id = ?1 ORDER BY created_at")?;
    let codes = stmt
        .query_map([referrer_id.as_str()], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(codes)
}

/// Insert a binding unless one already exists for the referred user.
///
/// Returns `true` if a new binding was written.
pub fn insert_binding_if_absent(conn: &Connection, row: &BindingRow) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO referral_bindings
            (referred_user_id, referrer_id, code, bound_at, qualified)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            row.referred_user_id.as_str(),
            row.referrer_id.as_str(),
            row.code,
            row.bound_at as i64,
            row.qualified,
        ],
    )?;
    Ok(inserted == 1)
}

fn map_binding(row: &rusqlite::Row<'_>) -> rusqlite::Result<BindingRow> {
    Ok(BindingRow {
        referred_user_id: UserId(row.get(0)?),
        referrer_id: UserId(row.get(1)?),
        code: row.get(2)?,
        bound_at: row.get::<_, i64>(3)? as u64,
        qualified: row.get(4)?,
    })
}

/// The binding of a referred user, if any.
pub fn binding_for(conn: &Connection, referred_user_id: &UserId) -> Result<Option<BindingRow>> {
    let row = conn
        .query_row(
            "SELECT referred_user_id, referrer_id, code, bound_at, qualified
             FROM referral_bindings WHERE referred_user_id = ?1",
            [referred_user_id.as_str()],
            map_binding,
        )
        .optional()?;
    Ok(row)
}

/// Bindings credited to a referrer, oldest first.
pub fn bindings_of(conn: &Connection, referrer_id: &UserId) -> Result<Vec<BindingRow>> {
    let mut stmt = conn.prepare(
        "SELECT referred_user_id, referrer_id, code, bound_at, qualified
         FROM referral_bindings WHERE referrer_id = ?1 ORDER BY bound_at ASC",
    )?;
    let rows = stmt
        .query_map([referrer_id.as_str()], map_binding)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Update the qualification flag of a referred user.
pub fn set_qualified(conn: &Connection, referred_user_id: &UserId, qualified: bool) -> Result<()> {
    let updated = conn.execute(
        "UPDATE referral_bindings SET qualified = ?1 WHERE referred_user_id = ?2",
        rusqlite::params![qualified, referred_user_id.as_str()],
    )?;
    if updated == 0 {
        return Err(DbError::NotFound(format!("referral binding for {referred_user_id}")));
    }
    Ok(())
}

/// Create or update an account's liveness flag.
pub fn upsert_account(conn: &Connection, user_id: &UserId, is_active: bool, now: u64) -> Result<()> {
    conn.execute(
        "INSERT INTO accounts (user_id, is_active, created_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(user_id) DO UPDATE SET is_active = excluded.is_active",
        rusqlite::params![user_id.as_str(), is_active, now as i64],
    )?;
    Ok(())
}

/// Create an active account unless one already exists.
pub fn ensure_account(conn: &Connection, user_id: &UserId, now: u64) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO accounts (user_id, is_active, created_at) VALUES (?1, 1, ?2)",
        rusqlite::params![user_id.as_str(), now as i64],
    )?;
    Ok(())
}

/// Whether an account is active. Unknown accounts are treated as deleted.
pub fn is_account_active(conn: &Connection, user_id: &UserId) -> Result<bool> {
    let active = conn
        .query_row(
            "SELECT is_active FROM accounts WHERE user_id = ?1",
            [user_id.as_str()],
            |row| row.get::<_, bool>(0),
        )
        .optional()?;
    Ok(active.unwrap_or(false))
}
