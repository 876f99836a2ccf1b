//! Retry and circuit breaking around a [`MinerClient`].

use super::{JsonMap, MinerClient};
use crate::Result;
use crate::resilience::RetryPolicy;
use std::collections::HashMap;
use std::sync::Arc;

/// Circuit name for a miner id.
#[must_use]
pub fn miner_circuit(miner_id: &str) -> String {
    format!("miner:{miner_id}")
}

/// A [`MinerClient`] whose calls all run through a [`RetryPolicy`] on the
/// miner's own circuit.
///
/// Itself a [`MinerClient`], so it can stand in wherever a raw client is
/// accepted.
#[derive(Debug)]
pub struct ResilientMinerClient<C> {
    inner: C,
    policy: Arc<RetryPolicy>,
    circuit: String,
}

impl<C: MinerClient> ResilientMinerClient<C> {
    /// Wraps `inner` with `policy`.
    #[must_use]
    pub fn new(inner: C, policy: Arc<RetryPolicy>) -> Self {
        let circuit = miner_circuit(inner.miner_id());
        Self {
            inner,
            policy,
            circuit,
        }
    }

    /// Circuit this client reports to.
    #[must_use]
    pub fn circuit(&self) -> &str {
        &self.circuit
    }

    /// Returns the wrapped client.
    #[must_use]
    pub const fn inner(&self) -> &C {
        &self.inner
    }

    /// Returns the retry policy.
    #[must_use]
    pub const fn policy(&self) -> &Arc<RetryPolicy> {
        &self.policy
    }
}

impl<C: MinerClient> MinerClient for ResilientMinerClient<C> {
    fn miner_id(&self) -> &str {
        self.inner.miner_id()
    }

    async fn connect(&self) -> Result<bool> {
        self.policy
            .execute("miner.connect", Some(self.circuit.as_str()), || self.inner.connect())
            .await
    }

    async fn get_status(&self) -> Result<JsonMap> {
        self.policy
            .execute("miner.get_status", Some(self.circuit.as_str()), || {
                self.inner.get_status()
            })
            .await
    }

    async fn get_metrics(&self) -> Result<HashMap<String, f64>> {
        self.policy
            .execute("miner.get_metrics", Some(self.circuit.as_str()), || {
                self.inner.get_metrics()
            })
            .await
    }

    async fn get_device_info(&self) -> Result<JsonMap> {
        self.policy
            .execute("miner.get_device_info", Some(self.circuit.as_str()), || {
                self.inner.get_device_info()
            })
            .await
    }

    async fn get_pool_info(&self) -> Result<Vec<JsonMap>> {
        self.policy
            .execute("miner.get_pool_info", Some(self.circuit.as_str()), || {
                self.inner.get_pool_info()
            })
            .await
    }

    async fn restart(&self) -> Result<bool> {
        self.policy
            .execute("miner.restart", Some(self.circuit.as_str()), || self.inner.restart())
            .await
    }

    async fn update_settings(&self, settings: &JsonMap) -> Result<bool> {
        self.policy
            .execute("miner.update_settings", Some(self.circuit.as_str()), || {
                self.inner.update_settings(settings)
            })
            .await
    }

    async fn disconnect(&self) -> Result<bool> {
        self.policy
            .execute("miner.disconnect", Some(self.circuit.as_str()), || {
                self.inner.disconnect()
            })
            .await
    }
}
