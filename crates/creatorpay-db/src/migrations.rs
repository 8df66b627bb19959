//! Database migration system.
//!
//! Schema version stored in `PRAGMA user_version`. Migrations are forward-only;
//! the ledger is append-only so there is no rollback path.

use rusqlite::Connection;

use crate::{schema, DbError, Result, SCHEMA_VERSION};

/// Run all pending migrations.
pub fn run(conn: &Connection) -> Result<()> {
    let current_version: u32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(DbError::Sqlite)?;

    if current_version == 0 {
        // Fresh database: apply the initial schema
        tracing::info!("Initializing database schema v{SCHEMA_VERSION}");
        conn.execute_batch(schema::SCHEMA_V1)
            .map_err(DbError::Sqlite)?;

        insert_default_tier(conn)?;

        conn.pragma_update(None, "user_version", SCHEMA_VERSION)
            .map_err(DbError::Sqlite)?;
    } else if current_version < SCHEMA_VERSION {
        for version in (current_version + 1)..=SCHEMA_VERSION {
            tracing::info!("Running migration to v{version}");
            run_migration(conn, version)?;
            conn.pragma_update(None, "user_version", version)
                .map_err(DbError::Sqlite)?;
        }
    } else if current_version > SCHEMA_VERSION {
        return Err(DbError::Migration(format!(
            "Database version {current_version} is newer than supported {SCHEMA_VERSION}"
        )));
    }

    Ok(())
}

/// Seed the level-1 fallback tier so tier resolution never comes up empty.
fn insert_default_tier(conn: &Connection) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO referral_tiers
            (tier_level, tier_name, min_referrals, min_commission_minor, commission_rate,
             bonus_per_referral_minor, tier_bonus_minor, is_active)
         VALUES (1, 'Bronze', 0, 0, '0.10', 0, 0, 1)",
        [],
    )
    .map_err(DbError::Sqlite)?;
    Ok(())
}

/// Run a specific migration.
fn run_migration(_conn: &Connection, version: u32) -> Result<()> {
    match version {
        _ => Err(DbError::Migration(format!(
            "Unknown migration version: {version}"
        ))),
    }
}
