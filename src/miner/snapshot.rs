//! Replays a recorded miner reading from JSON.

use super::{JsonMap, MinerClient};
use crate::{Error, Result, parse_timestamp};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// One recorded reading.
///
/// ```json
/// {
///   "timestamp": "2024-05-01T12:00:00Z",
///   "metrics": { "hashrate": 1.21, "temperature": 58.5 },
///   "status": { "state": "mining", "uptime": 86400 },
///   "device_info": { "model": "Bitaxe Gamma" },
///   "pools": [ { "url": "stratum+tcp://pool:3333" } ]
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MinerSnapshot {
    /// When the reading was taken; `None` means "now".
    #[serde(default)]
    pub timestamp: Option<String>,
    /// Numeric readings.
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
    /// Status document.
    #[serde(default)]
    pub status: JsonMap,
    /// Device information.
    #[serde(default)]
    pub device_info: JsonMap,
    /// Pool list.
    #[serde(default)]
    pub pools: Vec<JsonMap>,
}

impl MinerSnapshot {
    /// Parses a snapshot document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the JSON does not match.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Error::InvalidInput(format!("invalid miner snapshot: {e}")))
    }

    /// Reading time, defaulting to the current time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for a malformed timestamp.
    pub fn taken_at(&self) -> Result<DateTime<Utc>> {
        self.timestamp
            .as_deref()
            .map_or_else(|| Ok(Utc::now()), parse_timestamp)
    }
}

enum Source {
    File(PathBuf),
    Inline(MinerSnapshot),
}

/// A [`MinerClient`] that serves a recorded [`MinerSnapshot`].
///
/// File-backed clients read the file on [`connect`](MinerClient::connect);
/// an unreadable file surfaces as a connection error so it is retried like
/// an unreachable device. Restart and settings changes are not supported
/// and report `false`.
pub struct SnapshotClient {
    miner_id: String,
    source: Source,
    loaded: Mutex<Option<MinerSnapshot>>,
}

impl std::fmt::Debug for SnapshotClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotClient")
            .field("miner_id", &self.miner_id)
            .field("connected", &self.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl SnapshotClient {
    /// Creates a client that reads `path` on connect.
    #[must_use]
    pub fn from_file(miner_id: impl Into<String>, path: impl AsRef<Path>) -> Self {
        Self {
            miner_id: miner_id.into(),
            source: Source::File(path.as_ref().to_path_buf()),
            loaded: Mutex::new(None),
        }
    }

    /// Creates a client over an in-memory snapshot.
    #[must_use]
    pub fn from_snapshot(miner_id: impl Into<String>, snapshot: MinerSnapshot) -> Self {
        Self {
            miner_id: miner_id.into(),
            source: Source::Inline(snapshot),
            loaded: Mutex::new(None),
        }
    }

    /// The loaded snapshot, if connected.
    #[must_use]
    pub fn snapshot(&self) -> Option<MinerSnapshot> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Option<MinerSnapshot>> {
        self.loaded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read<T>(&self, operation: &str, f: impl FnOnce(&MinerSnapshot) -> T) -> Result<T> {
        self.lock().as_ref().map(f).ok_or_else(|| Error::Connection {
            operation: operation.to_string(),
            cause: format!("miner '{}' is not connected", self.miner_id),
        })
    }
}

impl MinerClient for SnapshotClient {
    fn miner_id(&self) -> &str {
        &self.miner_id
    }

    async fn connect(&self) -> Result<bool> {
        let snapshot = match &self.source {
            Source::Inline(snapshot) => snapshot.clone(),
            Source::File(path) => {
                let text =
                    tokio::fs::read_to_string(path)
                        .await
                        .map_err(|e| Error::Connection {
                            operation: "connect".to_string(),
                            cause: format!("{}: {e}", path.display()),
                        })?;
                MinerSnapshot::from_json(&text)?
            },
        };
        *self.lock() = Some(snapshot);
        tracing::debug!(miner_id = %self.miner_id, "Snapshot loaded");
        Ok(true)
    }

    async fn get_status(&self) -> Result<JsonMap> {
        self.read("get_status", |s| s.status.clone())
    }

    async fn get_metrics(&self) -> Result<HashMap<String, f64>> {
        self.read("get_metrics", |s| s.metrics.clone())
    }

    async fn get_device_info(&self) -> Result<JsonMap> {
        self.read("get_device_info", |s| s.device_info.clone())
    }

    async fn get_pool_info(&self) -> Result<Vec<JsonMap>> {
        self.read("get_pool_info", |s| s.pools.clone())
    }

    async fn restart(&self) -> Result<bool> {
        Ok(false)
    }

    async fn update_settings(&self, _settings: &JsonMap) -> Result<bool> {
        Ok(false)
    }

    async fn disconnect(&self) -> Result<bool> {
        Ok(self.lock().take().is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const DOC: &str = r#"{
        "timestamp": "2024-05-01T12:00:00Z",
        "metrics": { "hashrate": 1.21, "temperature": 58.5 },
        "status": { "state": "mining" },
        "pools": [ { "url": "stratum+tcp://pool:3333" } ]
    }"#;

    #[tokio::test]
    async fn test_file_snapshot_round() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(DOC.as_bytes()).unwrap();
        let client = SnapshotClient::from_file("bitaxe-1", file.path());

        assert!(matches!(
            client.get_metrics().await,
            Err(Error::Connection { .. })
        ));
        assert!(client.connect().await.unwrap());

        let metrics = client.get_metrics().await.unwrap();
        assert_eq!(metrics.get("temperature"), Some(&58.5));
        assert_eq!(client.get_status().await.unwrap()["state"], "mining");
        assert_eq!(client.get_pool_info().await.unwrap().len(), 1);
        assert!(client.get_device_info().await.unwrap().is_empty());
        assert!(!client.restart().await.unwrap());

        let taken = client.snapshot().unwrap().taken_at().unwrap();
        assert_eq!(taken, parse_timestamp("2024-05-01T12:00:00Z").unwrap());

        assert!(client.disconnect().await.unwrap());
        assert!(!client.disconnect().await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_file_is_connection_error() {
        let client = SnapshotClient::from_file("m", "/nonexistent/snapshot.json");
        assert!(matches!(
            client.connect().await,
            Err(Error::Connection { .. })
        ));
    }

    #[test]
    fn test_malformed_snapshot() {
        assert!(matches!(
            MinerSnapshot::from_json(r#"{"metrics": {"hashrate": "fast"}}"#),
            Err(Error::InvalidInput(_))
        ));
        let snapshot = MinerSnapshot::from_json(r#"{"timestamp": "yesterday"}"#).unwrap();
        assert!(snapshot.taken_at().is_err());
    }
}
