//! End-to-end tests through the public API.
//!
//! Each test builds a store from a [`MonitorConfig`] over a temporary
//! database file, the way the binary does.

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use hashwatch::config::MonitorConfig;
use hashwatch::miner::{MinerClient, ResilientMinerClient, SnapshotClient};
use hashwatch::models::{Interval, MinerRecord};
use hashwatch::resilience::{CircuitBreakerRegistry, CircuitState, RetryConfig, RetryPolicy};
use hashwatch::services::{MaintenanceTasks, MetricsPoller};
use hashwatch::storage::{DATABASE_CIRCUIT, TimeSeriesStore};
use hashwatch::Error;
use serde_json::json;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    config: MonitorConfig,
    registry: Arc<CircuitBreakerRegistry>,
    store: TimeSeriesStore,
}

async fn harness(toml: &str) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("data").join("hashwatch.db");
    std::fs::create_dir_all(db.parent().unwrap()).unwrap();
    let config = MonitorConfig::from_toml_str(toml)
        .unwrap()
        .with_database_path(&db);
    config.validate().unwrap();

    let registry = Arc::new(CircuitBreakerRegistry::new());
    let store = TimeSeriesStore::open(&config, Arc::clone(&registry))
        .await
        .unwrap();
    Harness {
        _dir: dir,
        config,
        registry,
        store,
    }
}

const FAST: &str = r"
[database]
max_connections = 3

[cache]
ttl_secs = 0

[retry]
max_attempts = 3
base_delay_ms = 5
max_delay_ms = 50
";

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap()
}

fn sample(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
    pairs.iter().map(|(k, v)| ((*k).to_string(), *v)).collect()
}

#[tokio::test]
async fn test_dashboard_flow() {
    let h = harness(FAST).await;
    h.store
        .upsert_miner(&MinerRecord::new("bitaxe-1", "Garage").with_host("192.168.1.50"))
        .await
        .unwrap();

    for i in 0..3 {
        h.store
            .save_metrics(
                "bitaxe-1",
                &sample(&[("hashrate", 500.0 + f64::from(i)), ("temperature", 65.5)]),
                t0() + ChronoDuration::minutes(10 * i64::from(i)),
            )
            .await
            .unwrap();
    }
    h.store
        .save_status("bitaxe-1", &json!({"state": "mining", "uptime": 3600}), t0())
        .await
        .unwrap();

    let latest = h.store.get_latest_metrics("bitaxe-1").await.unwrap();
    assert!((latest["hashrate"].value - 502.0).abs() < f64::EPSILON);
    assert_eq!(latest["temperature"].unit.as_deref(), Some("°C"));

    let raw = h
        .store
        .get_metrics_raw("bitaxe-1", t0(), t0() + ChronoDuration::minutes(30), None)
        .await
        .unwrap();
    assert_eq!(raw.len(), 6);
    assert!(raw.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

    let buckets = h
        .store
        .get_aggregated_metrics(
            "bitaxe-1",
            t0(),
            t0() + ChronoDuration::hours(1),
            Interval::HOUR,
            Some(&["hashrate".to_string()][..]),
        )
        .await
        .unwrap();
    assert_eq!(buckets.len(), 1);
    assert_eq!(buckets[0].sample_count, 3);
    assert!((buckets[0].avg_value - 501.0).abs() < 1e-9);
    assert!((buckets[0].min_value - 500.0).abs() < f64::EPSILON);
    assert!((buckets[0].max_value - 502.0).abs() < f64::EPSILON);

    let status = h.store.get_latest_status("bitaxe-1").await.unwrap().unwrap();
    assert_eq!(status["state"], "mining");

    // No data and failure are different outcomes
    assert!(h.store.get_latest_status("nobody").await.unwrap().is_none());
    assert!(
        h.store
            .get_metrics_raw("bitaxe-1", t0() + ChronoDuration::days(1), t0() + ChronoDuration::days(2), None)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_respect_pool_bound() {
    let h = harness(FAST).await;
    let miners: Vec<String> = (0..4).map(|i| format!("miner-{i}")).collect();
    for id in &miners {
        h.store.ensure_miner(id).await.unwrap();
    }

    let mut tasks = Vec::new();
    for (i, id) in miners.iter().enumerate() {
        for j in 0..10 {
            let store = h.store.clone();
            let id = id.clone();
            tasks.push(tokio::spawn(async move {
                let ts = t0() + ChronoDuration::seconds(i64::try_from(i * 100 + j).unwrap());
                store
                    .save_metrics(&id, &sample(&[("hashrate", 1.0), ("power", 15.0)]), ts)
                    .await
            }));
        }
    }

    let stats_store = h.store.clone();
    let watcher = tokio::spawn(async move {
        let mut peak = 0;
        for _ in 0..200 {
            let stats = stats_store.pool().get_connection_stats();
            assert_eq!(stats.max_connections, 3);
            peak = peak.max(stats.currently_in_use);
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        peak
    });

    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), 2);
    }
    let peak = watcher.await.unwrap();
    assert!(peak <= 3, "peak in-use {peak} exceeded the pool bound");

    let stats = h.store.pool().get_connection_stats();
    assert!(stats.total_created <= 3);
    assert_eq!(stats.currently_in_use, 0);

    for id in &miners {
        let rows = h
            .store
            .get_metrics_raw(id, t0(), t0() + ChronoDuration::hours(1), None)
            .await
            .unwrap();
        assert_eq!(rows.len(), 20);
    }
    assert_ne!(h.registry.state(DATABASE_CIRCUIT), Some(CircuitState::Open));
}

#[tokio::test]
async fn test_range_reads_are_cached_for_ttl() {
    let h = harness(
        r"
        [cache]
        ttl_secs = 60
        ",
    )
    .await;
    h.store.ensure_miner("m").await.unwrap();
    h.store
        .save_metrics("m", &sample(&[("hashrate", 1.0)]), t0())
        .await
        .unwrap();

    let end = t0() + ChronoDuration::hours(1);
    let first = h.store.get_metrics_raw("m", t0(), end, None).await.unwrap();
    h.store
        .save_metrics("m", &sample(&[("hashrate", 2.0)]), t0() + ChronoDuration::minutes(1))
        .await
        .unwrap();
    let second = h.store.get_metrics_raw("m", t0(), end, None).await.unwrap();

    assert_eq!(first, second);
    let stats = h.store.cache().stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);

    // Latest reads bypass the cache
    let latest = h.store.get_latest_metrics("m").await.unwrap();
    assert!((latest["hashrate"].value - 2.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_retention_cleanup_end_to_end() {
    let h = harness(FAST).await;
    h.store.ensure_miner("m").await.unwrap();
    let now = Utc::now();
    h.store
        .save_metrics("m", &sample(&[("hashrate", 1.0)]), now - ChronoDuration::days(35))
        .await
        .unwrap();
    h.store
        .save_status("m", &json!({"old": true}), now - ChronoDuration::days(35))
        .await
        .unwrap();
    h.store
        .save_metrics("m", &sample(&[("hashrate", 2.0)]), now - ChronoDuration::hours(1))
        .await
        .unwrap();

    let report = h
        .store
        .cleanup_old_metrics(h.config.retention.days)
        .await
        .unwrap();
    assert_eq!(report.metrics_deleted, 1);
    assert_eq!(report.status_deleted, 1);

    let remaining = h
        .store
        .get_metrics_raw("m", now - ChronoDuration::days(60), now, None)
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert!((remaining[0].value - 2.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_ingest_snapshot_file_through_poller() {
    let h = harness(FAST).await;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(
        br#"{
            "timestamp": "2024-06-01T10:05:00Z",
            "metrics": { "hashrate": 1.21, "fan_speed": 4200 },
            "status": { "state": "mining" }
        }"#,
    )
    .unwrap();

    let policy = Arc::new(RetryPolicy::new(h.config.retry_config(), Arc::clone(&h.registry)));
    let client = ResilientMinerClient::new(SnapshotClient::from_file("nerdqaxe", file.path()), policy);
    assert!(client.connect().await.unwrap());
    let taken_at = client.inner().snapshot().unwrap().taken_at().unwrap();

    let poller = MetricsPoller::new(h.store.clone(), h.config.retention.days);
    let report = poller.poll_at(&client, taken_at).await.unwrap();
    assert!(report.registered);
    assert_eq!(report.metrics_saved, 2);

    let latest = h.store.get_latest_metrics("nerdqaxe").await.unwrap();
    assert_eq!(latest["fan_speed"].timestamp, taken_at);
    assert_eq!(latest["fan_speed"].unit.as_deref(), Some("RPM"));
    assert_eq!(
        h.registry.state("miner:nerdqaxe"),
        Some(CircuitState::Closed)
    );
}

#[tokio::test]
async fn test_config_seeds_and_validation_errors() {
    let h = harness(
        r#"
        [[miners]]
        id = "bitaxe-1"
        name = "Garage"
        model = "Bitaxe Gamma"
        "#,
    )
    .await;
    for seed in &h.config.miners {
        h.store.upsert_miner(&seed.to_record()).await.unwrap();
    }
    let miners = h.store.list_miners().await.unwrap();
    assert_eq!(miners.len(), 1);
    assert_eq!(miners[0].model.as_deref(), Some("Bitaxe Gamma"));

    let err = h
        .store
        .get_metrics_raw("bitaxe-1", t0(), t0() - ChronoDuration::minutes(1), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    let err = h
        .store
        .save_metrics("bitaxe-1", &sample(&[("hashrate", f64::NAN)]), t0())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    assert!(Interval::parse("0h").is_err());
    assert!(Interval::parse("15x").is_err());
}

#[tokio::test]
async fn test_bad_retry_config_rejected_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let config = MonitorConfig::default()
        .with_database_path(dir.path().join("hw.db"))
        .with_retry(RetryConfig::default().with_max_attempts(0));
    let err = TimeSeriesStore::open(&config, Arc::new(CircuitBreakerRegistry::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn test_maintenance_tasks_stop_with_the_store() {
    let h = harness(
        r"
        [database]
        health_check_interval_secs = 1

        [retention]
        days = 7
        sweep_interval_secs = 1
        ",
    )
    .await;
    let tasks = MaintenanceTasks::start(&h.store, &h.config);
    tokio::task::yield_now().await;
    assert_eq!(tasks.running().len(), 3);

    tasks.shutdown().await;
    assert!(h.store.pool().is_closed());
    let err = h.store.list_miners().await.unwrap_err();
    assert!(matches!(err, Error::PoolClosed));
}

#[tokio::test]
async fn test_cleanup_with_out_of_range_days_is_rejected() {
    let h = harness(FAST).await;
    h.store.ensure_miner("m").await.unwrap();
    h.store
        .save_metrics("m", &sample(&[("hashrate", 1.0)]), Utc::now())
        .await
        .unwrap();

    let err = h.store.cleanup_old_metrics(200_000_000).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
    assert_eq!(h.store.get_latest_metrics("m").await.unwrap().len(), 1);
}
