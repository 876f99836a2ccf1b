//! Storage layer.
//!
//! Layers, leaves first:
//! - **sqlite**: connection setup, error classification, transactions
//! - **pool**: bounded async checkout of `SQLite` connections
//! - **cache**: short-lived read-through cache for range queries
//! - **timeseries**: the schema owner and query/aggregation engine

// Dropping pooled connections a little later than necessary is harmless.
#![allow(clippy::significant_drop_tightening)]

pub mod cache;
pub mod migrations;
pub mod pool;
pub mod sqlite;
pub mod timeseries;

pub use cache::{CacheConfig, CacheKey, CacheStats, CachedRows, QueryCache};
pub use pool::{ConnectionMeta, ConnectionPool, DatabaseTarget, PoolConfig, PoolStats, PooledConnection};
pub use timeseries::{DATABASE_CIRCUIT, TimeSeriesStore};

use crate::{Error, Result};
use std::path::PathBuf;

/// Returns the per-user data directory, e.g. `~/.local/share/hashwatch`.
///
/// # Errors
///
/// Returns [`Error::OperationFailed`] if no home directory can be found.
pub fn get_user_data_dir() -> Result<PathBuf> {
    directories::BaseDirs::new()
        .map(|b| b.data_local_dir().join("hashwatch"))
        .ok_or_else(|| Error::OperationFailed {
            operation: "get_user_data_dir".to_string(),
            cause: "Could not determine user data directory".to_string(),
        })
}
