//! Store command handlers.
//!
//! Each command opens the store, runs one operation and prints JSON.

use super::MinerAction;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hashwatch::config::MonitorConfig;
use hashwatch::miner::{MinerClient, ResilientMinerClient, SnapshotClient};
use hashwatch::models::{Interval, MinerRecord};
use hashwatch::resilience::{CircuitBreakerRegistry, RetryPolicy};
use hashwatch::services::MetricsPoller;
use hashwatch::storage::TimeSeriesStore;
use hashwatch::{Error, parse_timestamp};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

type CmdResult = Result<(), Box<dyn std::error::Error>>;

/// Default query window when `--start` is omitted.
const DEFAULT_WINDOW_HOURS: i64 = 24;

/// Opens the store, creating the database directory if needed.
pub(super) async fn open_store(
    config: &MonitorConfig,
    registry: Arc<CircuitBreakerRegistry>,
) -> Result<TimeSeriesStore, Box<dyn std::error::Error>> {
    let path = config.database_path()?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| Error::OperationFailed {
            operation: "create_data_dir".to_string(),
            cause: format!("{}: {e}", parent.display()),
        })?;
    }
    Ok(TimeSeriesStore::open(config, registry).await?)
}

fn print_json<T: Serialize>(value: &T) -> CmdResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Resolves `--start`/`--end`, defaulting to the last 24 hours.
fn resolve_range(
    start: Option<String>,
    end: Option<String>,
) -> Result<(DateTime<Utc>, DateTime<Utc>), Error> {
    let end = end.as_deref().map_or_else(|| Ok(Utc::now()), parse_timestamp)?;
    let start = match start.as_deref() {
        Some(s) => parse_timestamp(s)?,
        None => end - ChronoDuration::hours(DEFAULT_WINDOW_HOURS),
    };
    Ok((start, end))
}

fn metric_filter(metrics: &[String]) -> Option<&[String]> {
    (!metrics.is_empty()).then_some(metrics)
}

/// Init command.
pub async fn cmd_init(config: &MonitorConfig) -> CmdResult {
    let store = open_store(config, Arc::new(CircuitBreakerRegistry::new())).await?;
    for seed in &config.miners {
        store.upsert_miner(&seed.to_record()).await?;
    }
    println!("Database: {}", store.pool().target());
    println!("Registered miners: {}", config.miners.len());
    store.pool().close_all();
    Ok(())
}

/// Ingest command.
pub async fn cmd_ingest(
    config: &MonitorConfig,
    miner_id: String,
    file: PathBuf,
    timestamp: Option<String>,
) -> CmdResult {
    let registry = Arc::new(CircuitBreakerRegistry::new());
    let store = open_store(config, Arc::clone(&registry)).await?;
    let poller = MetricsPoller::new(store.clone(), config.retention.days);
    let client = ResilientMinerClient::new(
        SnapshotClient::from_file(&miner_id, &file),
        Arc::new(RetryPolicy::new(config.retry_config(), registry)),
    );

    // Connect up front so the snapshot's own timestamp is available
    client.connect().await?;
    let taken_at = match timestamp.as_deref() {
        Some(ts) => parse_timestamp(ts)?,
        None => client
            .inner()
            .snapshot()
            .map_or_else(|| Ok(Utc::now()), |s| s.taken_at())?,
    };

    let report = poller.poll_at(&client, taken_at).await?;
    print_json(&report)?;
    store.pool().close_all();
    Ok(())
}

/// Latest command.
pub async fn cmd_latest(config: &MonitorConfig, miner_id: String, status: bool) -> CmdResult {
    #[derive(Serialize)]
    struct Latest {
        metrics: std::collections::BTreeMap<String, hashwatch::LatestMetric>,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<serde_json::Value>,
    }

    let store = open_store(config, Arc::new(CircuitBreakerRegistry::new())).await?;
    let metrics = store.get_latest_metrics(&miner_id).await?;
    let status = if status {
        Some(
            store
                .get_latest_status(&miner_id)
                .await?
                .unwrap_or(serde_json::Value::Null),
        )
    } else {
        None
    };
    print_json(&Latest { metrics, status })?;
    store.pool().close_all();
    Ok(())
}

/// Raw command.
pub async fn cmd_raw(
    config: &MonitorConfig,
    miner_id: String,
    start: Option<String>,
    end: Option<String>,
    metrics: Vec<String>,
) -> CmdResult {
    let (start, end) = resolve_range(start, end)?;
    let store = open_store(config, Arc::new(CircuitBreakerRegistry::new())).await?;
    let points = store
        .get_metrics_raw(&miner_id, start, end, metric_filter(&metrics))
        .await?;
    print_json(&points)?;
    store.pool().close_all();
    Ok(())
}

/// Aggregate command.
pub async fn cmd_aggregate(
    config: &MonitorConfig,
    miner_id: String,
    start: Option<String>,
    end: Option<String>,
    interval: String,
    metrics: Vec<String>,
) -> CmdResult {
    let interval = Interval::parse(&interval)?;
    let (start, end) = resolve_range(start, end)?;
    let store = open_store(config, Arc::new(CircuitBreakerRegistry::new())).await?;
    let buckets = store
        .get_aggregated_metrics(&miner_id, start, end, interval, metric_filter(&metrics))
        .await?;
    print_json(&buckets)?;
    store.pool().close_all();
    Ok(())
}

/// Cleanup command.
pub async fn cmd_cleanup(config: &MonitorConfig, days: Option<u32>) -> CmdResult {
    let store = open_store(config, Arc::new(CircuitBreakerRegistry::new())).await?;
    let report = store
        .cleanup_old_metrics(days.unwrap_or(config.retention.days))
        .await?;
    print_json(&report)?;
    store.pool().close_all();
    Ok(())
}

/// Miners command.
pub async fn cmd_miners(config: &MonitorConfig, action: MinerAction) -> CmdResult {
    let store = open_store(config, Arc::new(CircuitBreakerRegistry::new())).await?;
    match action {
        MinerAction::List => print_json(&store.list_miners().await?)?,
        MinerAction::Add {
            id,
            name,
            model,
            host,
        } => {
            let mut record = MinerRecord::new(&id, name.unwrap_or_else(|| id.clone()));
            record.model = model;
            record.host = host;
            store.upsert_miner(&record).await?;
            println!("Registered miner '{id}'");
        },
        MinerAction::Remove { id } => {
            if store.delete_miner(&id).await? {
                println!("Deleted miner '{id}' and its samples");
            } else {
                println!("No miner named '{id}'");
            }
        },
    }
    store.pool().close_all();
    Ok(())
}
