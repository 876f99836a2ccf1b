//! Data models for hashwatch.
//!
//! Plain data carried between the miner clients, the time-series store and
//! the CLI. Everything here is `Serialize` so it can be printed as JSON.

mod aggregate;
mod metric;
mod miner;
mod retention;
mod status;

pub use aggregate::{AggregateBucket, Interval, aggregate};
pub use metric::{LatestMetric, MetricKind, MetricPoint, unit_for};
pub use miner::MinerRecord;
pub use retention::{CleanupReport, MAX_RETENTION_DAYS};
pub use status::StatusSnapshot;
