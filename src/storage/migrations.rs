//! Embedded `SQLite` schema migrations.
//!
//! Migrations are compiled into the binary and applied in version order when
//! the store opens. Each migration and its version record commit in one
//! transaction, so a failed migration leaves the schema at the previous
//! version.
//!
//! # Usage
//!
//! ```rust,ignore
//! use hashwatch::storage::migrations::{MIGRATIONS, run_migrations};
//!
//! let applied = run_migrations(&conn, MIGRATIONS)?;
//! ```

use super::sqlite::{storage_error, with_immediate_transaction};
use crate::{Error, Result};
use rusqlite::{Connection, OptionalExtension, params};

/// A single migration with version and SQL.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// Migration version (sequential, starting at 1).
    pub version: i32,
    /// Human-readable description.
    pub description: &'static str,
    /// SQL to apply; may hold several statements.
    pub sql: &'static str,
}

/// The store schema.
///
/// `AUTOINCREMENT` keeps row ids monotonic even after retention deletes the
/// newest rows, so "highest id" always means "inserted last".
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Miners, metric samples and status snapshots",
        sql: r"
            CREATE TABLE IF NOT EXISTS miners (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                model TEXT,
                host TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS miner_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                miner_id TEXT NOT NULL REFERENCES miners(id) ON DELETE CASCADE,
                timestamp TEXT NOT NULL,
                metric_type TEXT NOT NULL,
                value REAL NOT NULL,
                unit TEXT,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE INDEX IF NOT EXISTS idx_miner_metrics_miner_time
                ON miner_metrics(miner_id, timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_miner_metrics_type_time
                ON miner_metrics(metric_type, timestamp DESC);

            CREATE TABLE IF NOT EXISTS miner_status (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                miner_id TEXT NOT NULL REFERENCES miners(id) ON DELETE CASCADE,
                timestamp TEXT NOT NULL,
                status_data TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE INDEX IF NOT EXISTS idx_miner_status_miner_time
                ON miner_status(miner_id, timestamp DESC);
        ",
    },
    Migration {
        version: 2,
        description: "Latest-sample and retention indexes",
        sql: r"
            CREATE INDEX IF NOT EXISTS idx_miner_metrics_latest
                ON miner_metrics(miner_id, metric_type, timestamp DESC, id DESC);
            CREATE INDEX IF NOT EXISTS idx_miner_metrics_time
                ON miner_metrics(timestamp);
            CREATE INDEX IF NOT EXISTS idx_miner_status_time
                ON miner_status(timestamp);
        ",
    },
];

/// Maximum version across a set of migrations.
#[must_use]
pub const fn max_version(migrations: &[Migration]) -> i32 {
    let mut max = 0;
    let mut i = 0;
    while i < migrations.len() {
        if migrations[i].version > max {
            max = migrations[i].version;
        }
        i += 1;
    }
    max
}

/// Applies every migration newer than the recorded schema version.
///
/// Returns the number of migrations this call applied; versions recorded by
/// a concurrent migrator are not counted.
///
/// # Errors
///
/// Returns [`Error::OperationFailed`] naming the migration that failed, or a
/// storage error if the version table cannot be read.
pub fn run_migrations(conn: &Connection, migrations: &[Migration]) -> Result<usize> {
    conn.execute_batch(
        r"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        )
        ",
    )
    .map_err(|e| storage_error("create_migrations_table", &e))?;

    let mut applied = 0;
    for migration in migrations {
        // Re-read inside the loop: another process may be migrating too
        if migration.version <= current_version(conn)? {
            continue;
        }
        if apply(conn, migration)? {
            applied += 1;
        }
    }
    Ok(applied)
}

/// Returns the recorded schema version, `0` for a fresh database.
///
/// # Errors
///
/// Returns a storage error if the version table exists but cannot be read.
pub fn current_version(conn: &Connection) -> Result<i32> {
    let exists: Option<i32> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations'",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| storage_error("check_migrations_table", &e))?;
    if exists.is_none() {
        return Ok(0);
    }

    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )
    .map_err(|e| storage_error("read_schema_version", &e))
}

/// Applies one migration. Returns `false` if its version was already recorded.
fn apply(conn: &Connection, migration: &Migration) -> Result<bool> {
    let inserted = with_immediate_transaction(conn, |tx| {
        // Another writer may have applied it between our check and BEGIN
        let already: Option<i32> = tx
            .query_row(
                "SELECT version FROM schema_migrations WHERE version = ?1",
                params![migration.version],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| storage_error("check_migration", &e))?;
        if already.is_some() {
            return Ok(false);
        }

        tx.execute_batch(migration.sql)
            .map_err(|e| Error::OperationFailed {
                operation: format!("migration_v{}: {}", migration.version, migration.description),
                cause: e.to_string(),
            })?;
        tx.execute(
            "INSERT INTO schema_migrations (version, description) VALUES (?1, ?2)",
            params![migration.version, migration.description],
        )
        .map_err(|e| storage_error("record_migration", &e))?;
        Ok(true)
    })?;

    if inserted {
        tracing::info!(
            version = migration.version,
            description = migration.description,
            "Applied migration"
        );
    }
    Ok(inserted)
}
