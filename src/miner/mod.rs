//! Miner client interface.
//!
//! Hashwatch talks to mining hardware through [`MinerClient`]. Device
//! drivers implement it; the core only ever calls it through
//! [`ResilientMinerClient`], which adds retries and a per-miner circuit
//! (`miner:<id>`) so one unreachable device cannot stall a polling round.
//!
//! [`SnapshotClient`] replays a recorded JSON document and backs the
//! `ingest` command.

mod resilient;
mod snapshot;

pub use resilient::{ResilientMinerClient, miner_circuit};
pub use snapshot::{MinerSnapshot, SnapshotClient};

use crate::Result;
use std::collections::HashMap;
use std::future::Future;

/// A JSON object as returned by miner APIs.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Async access to one miner.
///
/// Every method may fail with [`Error::Connection`](crate::Error::Connection)
/// or [`Error::Timeout`](crate::Error::Timeout) when the device is
/// unreachable; those are retried by [`ResilientMinerClient`]. Anything else
/// is treated as permanent.
pub trait MinerClient: Send + Sync {
    /// Stable id of the miner this client talks to.
    fn miner_id(&self) -> &str;

    /// Opens the session. Returns `false` if the device refused it.
    fn connect(&self) -> impl Future<Output = Result<bool>> + Send;

    /// Current status document (uptime, firmware state, errors, ...).
    fn get_status(&self) -> impl Future<Output = Result<JsonMap>> + Send;

    /// Current numeric readings keyed by metric type.
    fn get_metrics(&self) -> impl Future<Output = Result<HashMap<String, f64>>> + Send;

    /// Static device information (model, firmware, MAC, ...).
    fn get_device_info(&self) -> impl Future<Output = Result<JsonMap>> + Send;

    /// Configured stratum pools.
    fn get_pool_info(&self) -> impl Future<Output = Result<Vec<JsonMap>>> + Send;

    /// Restarts the device.
    fn restart(&self) -> impl Future<Output = Result<bool>> + Send;

    /// Applies device settings such as frequency or fan speed.
    fn update_settings(&self, settings: &JsonMap) -> impl Future<Output = Result<bool>> + Send;

    /// Closes the session.
    fn disconnect(&self) -> impl Future<Output = Result<bool>> + Send;
}
