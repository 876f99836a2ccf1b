//! # Hashwatch
//!
//! Monitoring core for home cryptocurrency miners.
//!
//! Hashwatch polls mining hardware, keeps per-miner metric samples and status
//! snapshots in `SQLite`, and answers range and bucketed aggregation queries
//! for dashboards.
//!
//! ## Features
//!
//! - Retry with exponential backoff and per-circuit breakers for flaky miners
//!   and a busy database
//! - Bounded async `SQLite` connection pool with health monitoring
//! - Short-lived read-through query cache
//! - Time-series store with interval aggregation and retention cleanup
//!
//! ## Example
//!
//! ```rust,ignore
//! use hashwatch::CircuitBreakerRegistry;
//! use hashwatch::storage::TimeSeriesStore;
//! use std::sync::Arc;
//! use std::collections::HashMap;
//!
//! let registry = Arc::new(CircuitBreakerRegistry::new());
//! let store = TimeSeriesStore::open(&config, registry).await?;
//! let metrics = HashMap::from([("hashrate".to_string(), 500.0)]);
//! store.save_metrics("bitaxe-1", &metrics, chrono::Utc::now()).await?;
//! let latest = store.get_latest_metrics("bitaxe-1").await?;
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![allow(clippy::multiple_crate_versions)]

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use thiserror::Error as ThisError;

pub mod config;
pub mod miner;
pub mod models;
pub mod observability;
pub mod resilience;
pub mod services;
pub mod storage;

pub use config::MonitorConfig;
pub use miner::{MinerClient, ResilientMinerClient};
pub use models::{
    AggregateBucket, CleanupReport, Interval, LatestMetric, MetricKind, MetricPoint, MinerRecord,
    StatusSnapshot,
};
pub use resilience::{CircuitBreakerRegistry, CircuitState, RetryConfig, RetryPolicy};
pub use services::{MaintenanceTasks, MetricsPoller, PollReport};
pub use storage::{ConnectionPool, QueryCache, TimeSeriesStore};

/// Error type for hashwatch operations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When | Retryable |
/// |---------|-------------|-----------|
/// | `InvalidInput` | Malformed timestamps, bad intervals, empty miner ids, bad config values | no |
/// | `Connection` | Miner unreachable, database cannot be opened, I/O failures | yes |
/// | `Timeout` | A per-attempt or acquire deadline elapsed | yes |
/// | `CircuitOpen` | The named circuit is rejecting calls | no |
/// | `Storage` | A database statement failed | when `transient` |
/// | `PoolClosed` | The connection pool was shut down | no |
/// | `OperationFailed` | Config files, logging setup, anything not covered above | no |
#[derive(Debug, Clone, ThisError)]
pub enum Error {
    /// Invalid input was provided.
    ///
    /// Raised when:
    /// - A timestamp string does not parse as ISO-8601
    /// - A query range has `start > end`
    /// - An aggregation interval is malformed
    /// - A metric value is not finite
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A connection to a miner or the database failed.
    #[error("connection failed during '{operation}': {cause}")]
    Connection {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// An operation exceeded its deadline.
    #[error("operation '{operation}' timed out after {elapsed_ms}ms")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// Time spent before giving up.
        elapsed_ms: u64,
    },

    /// The circuit breaker guarding this call is open.
    #[error("circuit breaker open for '{circuit}'")]
    CircuitOpen {
        /// Name of the open circuit.
        circuit: String,
    },

    /// A storage statement failed.
    ///
    /// `transient` is derived from the driver error code: busy and locked
    /// databases or I/O failures are transient, constraint and schema
    /// violations are not.
    #[error("storage operation '{operation}' failed: {cause}")]
    Storage {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
        /// Whether retrying may succeed.
        transient: bool,
    },

    /// The connection pool has been closed.
    #[error("connection pool closed")]
    PoolClosed,

    /// An operation failed.
    ///
    /// Raised when:
    /// - Config files cannot be read or parsed
    /// - Logging or metrics exporters fail to install
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },
}

impl Error {
    /// Returns `true` if retrying the failed operation may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::Timeout { .. } => true,
            Self::Storage { transient, .. } => *transient,
            Self::InvalidInput(_)
            | Self::CircuitOpen { .. }
            | Self::PoolClosed
            | Self::OperationFailed { .. } => false,
        }
    }

    /// Short label used for metrics and log fields.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::Connection { .. } => "connection",
            Self::Timeout { .. } => "timeout",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Storage { .. } => "storage",
            Self::PoolClosed => "pool_closed",
            Self::OperationFailed { .. } => "operation_failed",
        }
    }
}

/// Result type alias for hashwatch operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Formats a timestamp in the fixed-width form used by the store.
///
/// Always UTC with six fractional digits and a `Z` suffix, so stored values
/// sort lexically in chronological order.
///
/// # Examples
///
/// ```rust
/// use chrono::{TimeZone, Utc};
/// use hashwatch::format_timestamp;
///
/// let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
/// assert_eq!(format_timestamp(ts), "2024-05-01T12:00:00.000000Z");
/// ```
#[must_use]
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses an ISO-8601 timestamp.
///
/// Accepts RFC 3339 (with offset or `Z`) and naive `YYYY-MM-DDTHH:MM:SS[.f]`
/// or `YYYY-MM-DD HH:MM:SS[.f]`, which are taken as UTC.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if the string is not a timestamp.
pub fn parse_timestamp(input: &str) -> Result<DateTime<Utc>> {
    let trimmed = input.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(Error::InvalidInput(format!(
        "malformed timestamp '{trimmed}', expected ISO-8601"
    )))
}
