//! Write transactions.

use super::connection::storage_error;
use crate::Result;
use rusqlite::Connection;

/// Runs `f` inside a `BEGIN IMMEDIATE` transaction.
///
/// The write lock is taken up front so concurrent writers wait on
/// `busy_timeout` at `BEGIN` instead of failing mid-transaction. Commits when
/// `f` succeeds and rolls back otherwise, so callers see all of `f`'s writes
/// or none of them.
///
/// # Errors
///
/// Returns the error from `f`, or a classified storage error if the
/// transaction cannot begin or commit.
pub fn with_immediate_transaction<T, F>(conn: &Connection, f: F) -> Result<T>
where
    F: FnOnce(&Connection) -> Result<T>,
{
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| storage_error("begin_transaction", &e))?;

    match f(conn) {
        Ok(value) => {
            if let Err(e) = conn.execute_batch("COMMIT") {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(storage_error("commit_transaction", &e));
            }
            Ok(value)
        },
        Err(err) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(err)
        },
    }
}
