//! Watch command handler.
//!
//! Keeps the store open and runs background upkeep until interrupted.

use super::store::open_store;
use hashwatch::config::MonitorConfig;
use hashwatch::resilience::CircuitBreakerRegistry;
use hashwatch::services::MaintenanceTasks;
use std::sync::Arc;

/// Watch command.
pub async fn cmd_watch(config: &MonitorConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(config, Arc::new(CircuitBreakerRegistry::new())).await?;
    for seed in &config.miners {
        store.upsert_miner(&seed.to_record()).await?;
    }

    let tasks = MaintenanceTasks::start(&store, config);
    println!("Watching {} (Ctrl-C to stop)", store.pool().target());
    println!("  Retention: {} days", config.retention.days);
    println!("  Tasks: {}", tasks.running().join(", "));

    let signal = tokio::signal::ctrl_c().await;
    tracing::info!("Shutting down maintenance tasks");
    tasks.shutdown().await;

    let stats = store.pool().get_connection_stats();
    tracing::info!(
        live = stats.total_created,
        in_use = stats.currently_in_use,
        "Store closed"
    );
    signal?;
    Ok(())
}
