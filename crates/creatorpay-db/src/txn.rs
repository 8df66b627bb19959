//! Transaction helper with bounded retry on lock contention.
//!
//! Writers take `BEGIN IMMEDIATE` so that a read-check-write sequence
//! (balance check, then append) cannot interleave with another writer.
//! When SQLite reports `SQLITE_BUSY`/`SQLITE_LOCKED` the whole body is
//! re-run from scratch, at most [`MAX_CONFLICT_RETRIES`] more times.

use std::time::Duration;

use rusqlite::{Connection, Transaction, TransactionBehavior};

use crate::DbError;

/// Re-runs of a transaction body after a lock conflict.
pub const MAX_CONFLICT_RETRIES: u32 = 3;

/// Base back-off between attempts, doubled on each retry.
const RETRY_BACKOFF: Duration = Duration::from_millis(20);

/// Error types that can come out of a retried transaction.
pub trait TxError: From<DbError> {
    /// The failure was lock contention and the body may be re-run.
    fn is_conflict(&self) -> bool;

    /// The error reported once retries are exhausted.
    fn conflict_exhausted(attempts: u32) -> Self;
}

impl TxError for DbError {
    fn is_conflict(&self) -> bool {
        self.is_busy()
    }

    fn conflict_exhausted(attempts: u32) -> Self {
        DbError::Busy { attempts }
    }
}

/// Run `body` inside a `BEGIN IMMEDIATE` transaction, committing on `Ok`.
pub fn immediate<T, E, F>(conn: &mut Connection, body: F) -> Result<T, E>
where
    E: TxError,
    F: FnMut(&Transaction<'_>) -> Result<T, E>,
{
    run(conn, TransactionBehavior::Immediate, body)
}

/// Run `body` inside a deferred (read-first) transaction.
pub fn deferred<T, E, F>(conn: &mut Connection, body: F) -> Result<T, E>
where
    E: TxError,
    F: FnMut(&Transaction<'_>) -> Result<T, E>,
{
    run(conn, TransactionBehavior::Deferred, body)
}

fn run<T, E, F>(conn: &mut Connection, behavior: TransactionBehavior, mut body: F) -> Result<T, E>
where
    E: TxError,
    F: FnMut(&Transaction<'_>) -> Result<T, E>,
{
    let mut attempt = 0;
    loop {
        match attempt_once(conn, behavior, &mut body) {
            Err(e) if e.is_conflict() => {
                if attempt >= MAX_CONFLICT_RETRIES {
                    tracing::warn!(attempts = attempt + 1, "transaction gave up on lock conflict");
                    return Err(E::conflict_exhausted(attempt + 1));
                }
                attempt += 1;
                tracing::warn!(attempt, "lock conflict, retrying transaction");
                std::thread::sleep(RETRY_BACKOFF * 2u32.pow(attempt - 1));
            }
            other => return other,
        }
    }
}

fn attempt_once<T, E, F>(conn: &mut Connection, behavior: TransactionBehavior, body: &mut F) -> Result<T, E>
where
    E: TxError,
    F: FnMut(&Transaction<'_>) -> Result<T, E>,
{
    let tx = conn
        .transaction_with_behavior(behavior)
        .map_err(DbError::from)?;
    let value = body(&tx)?;
    tx.commit().map_err(DbError::from)?;
    Ok(value)
}
