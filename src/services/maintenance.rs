//! Background upkeep for a long-running store.
//!
//! Starts the pool health monitor, the cache sweeper and the retention sweep
//! with the periods from [`MonitorConfig`], and stops them together.

use crate::config::MonitorConfig;
use crate::services::MetricsPoller;
use crate::storage::{ConnectionPool, TimeSeriesStore};
use tokio::task::JoinHandle;

/// Handles to the running upkeep tasks.
#[derive(Debug)]
pub struct MaintenanceTasks {
    pool: ConnectionPool,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl MaintenanceTasks {
    /// Spawns every upkeep task for `store`.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(store: &TimeSeriesStore, config: &MonitorConfig) -> Self {
        let poller = MetricsPoller::new(store.clone(), config.retention.days);
        let tasks = vec![
            ("pool_health", store.pool().spawn_health_monitor()),
            ("cache_sweep", store.cache().spawn_sweeper()),
            (
                "retention",
                poller.spawn_retention_task(config.retention.sweep_interval),
            ),
        ];
        tracing::info!(
            health_check_secs = config.database.health_check_interval.as_secs(),
            cache_sweep_secs = config.cache.sweep_interval.as_secs(),
            retention_sweep_secs = config.retention.sweep_interval.as_secs(),
            retention_days = config.retention.days,
            "Maintenance tasks started"
        );
        Self {
            pool: store.pool().clone(),
            tasks,
        }
    }

    /// Names of tasks that are still running.
    #[must_use]
    pub fn running(&self) -> Vec<&'static str> {
        self.tasks
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(name, _)| *name)
            .collect()
    }

    /// Closes the pool and waits for every task to stop.
    pub async fn shutdown(self) {
        self.pool.close_all();
        for (name, handle) in self.tasks {
            handle.abort();
            match handle.await {
                Ok(()) => tracing::debug!(task = name, "Maintenance task exited"),
                Err(e) if e.is_cancelled() => tracing::debug!(task = name, "Maintenance task cancelled"),
                Err(e) => tracing::warn!(task = name, error = %e, "Maintenance task panicked"),
            }
        }
    }
}
