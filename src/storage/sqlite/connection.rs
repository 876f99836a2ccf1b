//! Connection setup and error classification for `SQLite`.

use crate::{Error, Result};
use rusqlite::{Connection, ErrorCode, OpenFlags};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Busy timeout applied to every connection, in milliseconds.
pub const BUSY_TIMEOUT_MS: u32 = 5_000;

/// Helper to acquire mutex lock with poison recovery.
///
/// If the mutex is poisoned (due to a panic in a previous critical section),
/// we recover the inner value and log a warning. Pool and cache bookkeeping
/// stays consistent because every critical section is a handful of field
/// updates.
pub fn acquire_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("Mutex was poisoned, recovering");
            metrics::counter!("sqlite_mutex_poison_recovery_total").increment(1);
            poisoned.into_inner()
        },
    }
}

/// Opens a database file.
///
/// # Errors
///
/// Returns [`Error::Connection`] if the file cannot be opened.
pub fn open_file(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).map_err(|e| connection_error("open_sqlite", &e))?;
    configure_connection(&conn)?;
    Ok(conn)
}

/// Opens a named shared-cache in-memory database.
///
/// Every connection opened with the same name sees the same database for
/// as long as at least one of them stays open.
///
/// # Errors
///
/// Returns [`Error::Connection`] if the database cannot be opened.
pub fn open_shared_memory(name: &str) -> Result<Connection> {
    let uri = format!("file:{name}?mode=memory&cache=shared");
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(uri, flags)
        .map_err(|e| connection_error("open_sqlite_in_memory", &e))?;
    configure_connection(&conn)?;
    Ok(conn)
}

/// Configures a `SQLite` connection for concurrent pooled access.
///
/// # Configuration Applied
///
/// - **WAL mode**: concurrent readers alongside a single writer
/// - **NORMAL synchronous**: balances durability with performance
/// - **`busy_timeout`**: waits up to 5 seconds on lock contention before
///   reporting `SQLITE_BUSY`
/// - **`foreign_keys`**: enforces `ON DELETE CASCADE` from `miners`
///
/// # Errors
///
/// Returns [`Error::Storage`] if foreign key enforcement cannot be enabled.
pub fn configure_connection(conn: &Connection) -> Result<()> {
    // journal_mode returns a row, and in-memory databases refuse WAL, so the
    // result is ignored
    let _ = conn.pragma_update(None, "journal_mode", "WAL");
    let _ = conn.pragma_update(None, "synchronous", "NORMAL");
    conn.busy_timeout(std::time::Duration::from_millis(u64::from(BUSY_TIMEOUT_MS)))
        .map_err(|e| storage_error("configure_busy_timeout", &e))?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(|e| storage_error("enable_foreign_keys", &e))?;
    Ok(())
}

/// Runs the lightweight liveness ping used by the pool's health monitor.
///
/// # Errors
///
/// Returns the classified driver error if the ping fails.
pub fn ping(conn: &Connection) -> Result<()> {
    conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
        .map(|_| ())
        .map_err(|e| classify("health_check", &e))
}

/// Classifies a driver error by its result code.
///
/// - I/O, open, corruption and not-a-database failures mean the handle itself
///   is suspect: [`Error::Connection`].
/// - Busy, locked, interrupted, schema-changed and out-of-memory failures are
///   transient: [`Error::Storage`] with `transient = true`.
/// - Everything else (constraints, type mismatches, SQL errors) is permanent.
#[must_use]
pub fn classify(operation: &str, err: &rusqlite::Error) -> Error {
    match sqlite_code(err) {
        Some(
            ErrorCode::SystemIoFailure
            | ErrorCode::CannotOpen
            | ErrorCode::NotADatabase
            | ErrorCode::DatabaseCorrupt,
        ) => connection_error(operation, err),
        _ => storage_error(operation, err),
    }
}

/// Wraps a driver error as [`Error::Connection`].
#[must_use]
pub fn connection_error(operation: &str, err: &rusqlite::Error) -> Error {
    Error::Connection {
        operation: operation.to_string(),
        cause: err.to_string(),
    }
}

/// Wraps a driver error as [`Error::Storage`], deriving `transient` from the
/// result code.
#[must_use]
pub fn storage_error(operation: &str, err: &rusqlite::Error) -> Error {
    let transient = matches!(
        sqlite_code(err),
        Some(
            ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::OperationInterrupted
                | ErrorCode::SchemaChanged
                | ErrorCode::OutOfMemory
                | ErrorCode::FileLockingProtocolFailed
        )
    );
    Error::Storage {
        operation: operation.to_string(),
        cause: err.to_string(),
        transient,
    }
}

fn sqlite_code(err: &rusqlite::Error) -> Option<ErrorCode> {
    match err {
        rusqlite::Error::SqliteFailure(inner, _) => Some(inner.code),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn failure(code: i32) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None)
    }

    #[test]
    fn test_acquire_lock_concurrent() {
        let mutex = Arc::new(Mutex::new(0));
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                thread::spawn(move || {
                    *acquire_lock(&mutex) += 1;
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*acquire_lock(&mutex), 10);
    }

    #[test]
    fn test_configure_connection() {
        let conn = Connection::open_in_memory().unwrap();
        configure_connection(&conn).unwrap();

        let synchronous: i32 = conn
            .pragma_query_value(None, "synchronous", |row| row.get(0))
            .unwrap();
        assert_eq!(synchronous, 1, "Expected NORMAL synchronous mode (1)");

        let busy_timeout: i32 = conn
            .pragma_query_value(None, "busy_timeout", |row| row.get(0))
            .unwrap();
        assert_eq!(busy_timeout, 5000);

        let foreign_keys: i32 = conn
            .pragma_query_value(None, "foreign_keys", |row| row.get(0))
            .unwrap();
        assert_eq!(foreign_keys, 1);
    }

    #[test]
    fn test_file_connection_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_file(&dir.path().join("wal.db")).unwrap();
        let journal_mode: String = conn
            .pragma_query_value(None, "journal_mode", |row| row.get(0))
            .unwrap();
        assert_eq!(journal_mode.to_lowercase(), "wal");
        ping(&conn).unwrap();
    }

    #[test]
    fn test_busy_and_locked_are_transient() {
        for code in [rusqlite::ffi::SQLITE_BUSY, rusqlite::ffi::SQLITE_LOCKED] {
            let err = classify("insert", &failure(code));
            assert!(matches!(err, Error::Storage { transient: true, .. }), "{err}");
            assert!(err.is_retryable());
        }
    }

    #[test]
    fn test_constraint_violation_is_permanent() {
        let err = classify("insert", &failure(rusqlite::ffi::SQLITE_CONSTRAINT));
        assert!(matches!(err, Error::Storage { transient: false, .. }));
        assert!(!err.is_retryable());

        let err = classify("query", &rusqlite::Error::QueryReturnedNoRows);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_io_failure_is_connection_error() {
        let err = classify("select", &failure(rusqlite::ffi::SQLITE_IOERR));
        assert!(matches!(err, Error::Connection { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_real_constraint_failure_classified_from_code() {
        let conn = Connection::open_in_memory().unwrap();
        configure_connection(&conn).unwrap();
        conn.execute_batch(
            "CREATE TABLE parent (id TEXT PRIMARY KEY);
             CREATE TABLE child (parent_id TEXT NOT NULL REFERENCES parent(id));",
        )
        .unwrap();
        let err = conn
            .execute("INSERT INTO child (parent_id) VALUES ('missing')", [])
            .unwrap_err();
        let classified = classify("insert_child", &err);
        assert!(matches!(classified, Error::Storage { transient: false, .. }));
    }
}
