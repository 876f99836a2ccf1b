//! Miner polling and retention sweeps.

use crate::miner::{MinerClient, ResilientMinerClient};
use crate::models::CleanupReport;
use crate::storage::TimeSeriesStore;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::instrument;

/// What one poll persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollReport {
    /// Polled miner.
    pub miner_id: String,
    /// Timestamp the samples were stored under.
    pub timestamp: DateTime<Utc>,
    /// Metric rows written.
    pub metrics_saved: usize,
    /// Whether the miner was registered by this poll.
    pub registered: bool,
}

/// Moves readings from miners into the [`TimeSeriesStore`] and keeps the
/// store inside its retention window.
#[derive(Debug, Clone)]
pub struct MetricsPoller {
    store: TimeSeriesStore,
    retention_days: u32,
}

impl MetricsPoller {
    /// Creates a poller writing to `store`.
    #[must_use]
    pub const fn new(store: TimeSeriesStore, retention_days: u32) -> Self {
        Self {
            store,
            retention_days,
        }
    }

    /// Returns the store.
    #[must_use]
    pub const fn store(&self) -> &TimeSeriesStore {
        &self.store
    }

    /// Returns the retention window in days.
    #[must_use]
    pub const fn retention_days(&self) -> u32 {
        self.retention_days
    }

    /// Polls one miner now and persists its metrics and status.
    ///
    /// # Errors
    ///
    /// See [`poll_at`](Self::poll_at).
    pub async fn poll_once<C: MinerClient>(
        &self,
        client: &ResilientMinerClient<C>,
    ) -> Result<PollReport> {
        self.poll_at(client, Utc::now()).await
    }

    /// Polls one miner and stores the reading under `timestamp`.
    ///
    /// Unknown miners are registered first. Metrics and status are both
    /// fetched before anything is written, so a failed fetch stores nothing.
    ///
    /// # Errors
    ///
    /// - [`Error::Connection`] if the miner refuses the session, or the
    ///   miner's retry errors once exhausted
    /// - [`Error::CircuitOpen`] while the miner's circuit is open
    /// - any storage error from the writes
    #[instrument(skip(self, client), fields(miner_id = %client.miner_id()))]
    pub async fn poll_at<C: MinerClient>(
        &self,
        client: &ResilientMinerClient<C>,
        timestamp: DateTime<Utc>,
    ) -> Result<PollReport> {
        let start = Instant::now();
        let result = self.poll_inner(client, timestamp).await;

        let status = if result.is_ok() { "success" } else { "error" };
        metrics::counter!("miner_polls_total", "status" => status).increment(1);
        metrics::histogram!("miner_poll_duration_ms").record(start.elapsed().as_secs_f64() * 1000.0);

        match &result {
            Ok(report) => tracing::debug!(
                metrics_saved = report.metrics_saved,
                registered = report.registered,
                "Poll stored"
            ),
            Err(e) => tracing::warn!(error = %e, "Poll failed"),
        }
        result
    }

    async fn poll_inner<C: MinerClient>(
        &self,
        client: &ResilientMinerClient<C>,
        timestamp: DateTime<Utc>,
    ) -> Result<PollReport> {
        let miner_id = client.miner_id().to_string();
        if !client.connect().await? {
            return Err(Error::Connection {
                operation: "connect".to_string(),
                cause: format!("miner '{miner_id}' refused the session"),
            });
        }

        let metrics = client.get_metrics().await?;
        let status = client.get_status().await?;

        let registered = self.store.ensure_miner(&miner_id).await?;
        let metrics_saved = self
            .store
            .save_metrics(&miner_id, &metrics, timestamp)
            .await?;
        self.store
            .save_status(&miner_id, &JsonValue::Object(status), timestamp)
            .await?;

        Ok(PollReport {
            miner_id,
            timestamp,
            metrics_saved,
            registered,
        })
    }

    /// Deletes samples older than the retention window.
    ///
    /// # Errors
    ///
    /// Returns the store's error; nothing is deleted on failure.
    pub async fn run_retention_once(&self) -> Result<CleanupReport> {
        self.store.cleanup_old_metrics(self.retention_days).await
    }

    /// Runs [`run_retention_once`](Self::run_retention_once) every `interval`
    /// until the store's pool closes or the task is aborted.
    ///
    /// The first sweep happens one interval after spawning. Failed sweeps
    /// are logged and retried on the next tick.
    #[must_use]
    pub fn spawn_retention_task(&self, interval: Duration) -> JoinHandle<()> {
        let poller = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if poller.store.pool().is_closed() {
                    break;
                }
                match poller.run_retention_once().await {
                    Ok(report) => tracing::debug!(
                        deleted = report.total_deleted(),
                        "Retention sweep complete"
                    ),
                    Err(Error::PoolClosed) => break,
                    Err(e) => tracing::warn!(error = %e, "Retention sweep failed"),
                }
            }
        })
    }
}
