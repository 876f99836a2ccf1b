//! Registered miners.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A miner registered with the store.
///
/// Metric and status rows reference a miner by `id`; deleting the miner
/// deletes its rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinerRecord {
    /// Stable identifier, e.g. `bitaxe-1`.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Hardware model, e.g. `Bitaxe Gamma`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Host or IP address the miner is polled at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// When the miner was first registered.
    pub created_at: DateTime<Utc>,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
}

impl MinerRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            model: None,
            host: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the hardware model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the polled host.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }
}
