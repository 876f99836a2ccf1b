//! Miner status snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One stored status payload.
///
/// `status_data` is whatever structured document the miner client returned,
/// kept opaque and stored as JSON text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Owning miner.
    pub miner_id: String,
    /// Snapshot time.
    pub timestamp: DateTime<Utc>,
    /// Opaque status document.
    pub status_data: Value,
}
