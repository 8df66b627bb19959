//! # creatorpay-db
//!
//! Storage layer for the creator revenue engine.
//! Manages the single SQLite database at `$CREATORPAY_DATA_DIR/creatorpay.db`.
//!
//! ## Schema
//!
//! - WAL mode mandatory
//! - Foreign keys enforced
//! - Amounts stored as integer minor units (cents); fractions as decimal text
//! - All timestamps are Unix epoch seconds (u64)
//! - Schema version stored in `PRAGMA user_version`
//! - `revenue_entries` is append-only, enforced by triggers

pub mod migrations;
pub mod queries;
pub mod schema;
pub mod txn;

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use creatorpay_types::money;
use rusqlite::{Connection, ErrorCode};
use rust_decimal::Decimal;

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Database error types.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("database still locked after {attempts} attempts")]
    Busy { attempts: u32 },
}

impl DbError {
    /// The database was locked by another writer.
    pub fn is_busy(&self) -> bool {
        matches!(self, DbError::Busy { .. })
            || matches!(
                self,
                DbError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                    if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
            )
    }

    /// A UNIQUE / PRIMARY KEY / CHECK constraint rejected the write.
    pub fn is_constraint(&self) -> bool {
        matches!(self, DbError::Constraint(_))
            || matches!(
                self,
                DbError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation
            )
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

/// The process-wide connection shared by every engine component.
pub type SharedConnection = Arc<Mutex<Connection>>;

/// Wrap a connection for sharing.
pub fn shared(conn: Connection) -> SharedConnection {
    Arc::new(Mutex::new(conn))
}

/// Open or create the database at the given path.
///
/// Configures WAL mode, foreign keys, and runs any pending migrations.
pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    configure(&conn)?;
    migrations::run(&conn)?;
    Ok(conn)
}

/// Open an in-memory database (for testing).
pub fn open_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    configure(&conn)?;
    migrations::run(&conn)?;
    Ok(conn)
}

/// Configure SQLite pragmas.
fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = -8000;",
    )?;
    Ok(())
}

/// Convert an amount into integer minor units for storage.
pub fn to_minor(amount: Decimal) -> Result<i64> {
    money::to_minor_units(amount).ok_or_else(|| {
        DbError::Serialization(format!("amount {amount} is not representable in minor units"))
    })
}

/// Parse a decimal fraction stored as text.
pub(crate) fn parse_decimal(text: &str) -> Result<Decimal> {
    Decimal::from_str(text).map_err(|e| DbError::Serialization(format!("bad decimal {text:?}: {e}")))
}

/// Parse a persisted enum column.
pub(crate) fn parse_enum<T>(text: &str) -> Result<T>
where
    T: FromStr<Err = creatorpay_types::TypesError>,
{
    text.parse::<T>()
        .map_err(|e| DbError::Serialization(e.to_string()))
}

/// Map a unique-constraint failure to [`DbError::Constraint`].
pub(crate) fn map_constraint(err: rusqlite::Error, what: &str) -> DbError {
    match err {
        rusqlite::Error::SqliteFailure(e, msg) if e.code == ErrorCode::ConstraintViolation => {
            DbError::Constraint(format!("{what}: {}", msg.unwrap_or_default()))
        }
        other => DbError::Sqlite(other),
    }
}
