//! Retention cleanup results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Longest accepted retention window (100 years).
pub const MAX_RETENTION_DAYS: u32 = 36_500;

/// Outcome of one retention sweep.
///
/// Both counts come from the same transaction: either every row older than
/// `cutoff` was removed or none was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Rows strictly older than this were deleted.
    pub cutoff: DateTime<Utc>,
    /// Metric rows deleted.
    pub metrics_deleted: usize,
    /// Status rows deleted.
    pub status_deleted: usize,
}

impl CleanupReport {
    /// Total rows deleted.
    #[must_use]
    pub const fn total_deleted(&self) -> usize {
        self.metrics_deleted + self.status_deleted
    }
}
