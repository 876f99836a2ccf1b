//! Per-miner metric samples and status snapshots in `SQLite`.
//!
//! # Storage Model
//!
//! | Table | Rows | Written by |
//! |-------|------|------------|
//! | `miners` | one per registered miner | [`TimeSeriesStore::upsert_miner`] |
//! | `miner_metrics` | one per metric key per sample | [`TimeSeriesStore::save_metrics`] |
//! | `miner_status` | one per status snapshot | [`TimeSeriesStore::save_status`] |
//!
//! Timestamps are stored as fixed-width UTC text
//! (`YYYY-MM-DDTHH:MM:SS.ffffffZ`), so lexical order equals time order and
//! range scans compare strings.
//!
//! # Failure Handling
//!
//! Every operation checks out a pooled connection and runs through the
//! store's [`RetryPolicy`] on the `database` circuit. Busy or locked
//! databases and I/O failures are retried; constraint violations and
//! malformed input fail immediately. Each write runs in one transaction.
//!
//! # Caching
//!
//! Range reads go through the [`QueryCache`]. Writes do not invalidate it,
//! so a range read may miss samples written less than one cache TTL ago.
//! Latest-value reads always hit the database.

use super::cache::{CacheKey, CachedRows, QueryCache};
use super::migrations::{MIGRATIONS, run_migrations};
use super::pool::ConnectionPool;
use super::sqlite::{
    classify, record_operation_metrics, status_label, with_immediate_transaction,
};
use crate::config::MonitorConfig;
use crate::models::{
    AggregateBucket, CleanupReport, Interval, LatestMetric, MAX_RETENTION_DAYS, MetricPoint,
    MinerRecord, aggregate, unit_for,
};
use crate::resilience::{CircuitBreakerRegistry, RetryPolicy};
use crate::{Error, Result, format_timestamp, parse_timestamp};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::instrument;

/// Circuit name shared by every store operation.
pub const DATABASE_CIRCUIT: &str = "database";

const RANGE_COLUMNS: &str = "id, miner_id, timestamp, metric_type, value, unit";

/// Durable time-series storage for miner metrics and status.
///
/// Cheap to clone; clones share the pool, cache and retry policy.
#[derive(Debug, Clone)]
pub struct TimeSeriesStore {
    pool: ConnectionPool,
    cache: Arc<QueryCache>,
    retry: Arc<RetryPolicy>,
    cache_ttl: Duration,
}

impl TimeSeriesStore {
    /// Creates a store over existing components.
    ///
    /// Range reads are cached for the cache's default TTL. Call
    /// [`initialize`](Self::initialize) before the first read or write.
    #[must_use]
    pub fn new(pool: ConnectionPool, cache: Arc<QueryCache>, retry: Arc<RetryPolicy>) -> Self {
        let cache_ttl = cache.default_ttl();
        Self {
            pool,
            cache,
            retry,
            cache_ttl,
        }
    }

    /// Builds the pool, cache and retry policy described by `config` and
    /// applies pending migrations.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for invalid tunables, or the error
    /// from running migrations.
    pub async fn open(
        config: &MonitorConfig,
        registry: Arc<CircuitBreakerRegistry>,
    ) -> Result<Self> {
        let retry_config = config.retry_config();
        retry_config.validate()?;
        let pool = ConnectionPool::new(config.database_target(), config.pool_config())?;
        let cache = Arc::new(QueryCache::new(config.cache_config()));
        let store = Self::new(pool, cache, Arc::new(RetryPolicy::new(retry_config, registry)));
        store.initialize().await?;
        Ok(store)
    }

    /// Overrides the TTL used for range reads. Zero disables caching.
    #[must_use]
    pub const fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Returns the connection pool.
    #[must_use]
    pub const fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Returns the query cache.
    #[must_use]
    pub const fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    /// Returns the retry policy.
    #[must_use]
    pub const fn retry_policy(&self) -> &Arc<RetryPolicy> {
        &self.retry
    }

    /// Applies pending schema migrations and returns how many ran.
    ///
    /// # Errors
    ///
    /// Returns an error if a migration fails.
    #[instrument(skip(self), fields(operation = "initialize", backend = "sqlite"))]
    pub async fn initialize(&self) -> Result<usize> {
        let applied = self
            .run("initialize", |conn| run_migrations(conn, MIGRATIONS))
            .await?;
        tracing::info!(applied, target = %self.pool.target(), "Time-series store ready");
        Ok(applied)
    }

    /// Registers a miner or updates its name, model and host.
    ///
    /// The original `created_at` of an existing miner is kept.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an empty id, or a storage error.
    #[instrument(skip(self, miner), fields(operation = "upsert_miner", backend = "sqlite", miner_id = %miner.id))]
    pub async fn upsert_miner(&self, miner: &MinerRecord) -> Result<()> {
        validate_miner_id(&miner.id)?;
        let miner = miner.clone();
        self.run("upsert_miner", move |conn| {
            conn.execute(
                "INSERT INTO miners (id, name, model, host, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                     name = excluded.name,
                     model = excluded.model,
                     host = excluded.host,
                     updated_at = excluded.updated_at",
                params![
                    miner.id,
                    miner.name,
                    miner.model,
                    miner.host,
                    format_timestamp(miner.created_at),
                    format_timestamp(miner.updated_at),
                ],
            )
            .map_err(|e| classify("upsert_miner", &e))?;
            Ok(())
        })
        .await
    }

    /// Registers `miner_id` with its id as name unless it already exists.
    ///
    /// Returns `true` if a new miner was created.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an empty id, or a storage error.
    pub async fn ensure_miner(&self, miner_id: &str) -> Result<bool> {
        validate_miner_id(miner_id)?;
        let record = MinerRecord::new(miner_id, miner_id);
        self.run("ensure_miner", move |conn| {
            let created = conn
                .execute(
                    "INSERT OR IGNORE INTO miners (id, name, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?3)",
                    params![record.id, record.name, format_timestamp(record.created_at)],
                )
                .map_err(|e| classify("ensure_miner", &e))?;
            Ok(created > 0)
        })
        .await
    }

    /// Returns a registered miner.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the lookup fails.
    pub async fn get_miner(&self, miner_id: &str) -> Result<Option<MinerRecord>> {
        let miner_id = miner_id.to_string();
        self.run("get_miner", move |conn| {
            conn.query_row(
                "SELECT id, name, model, host, created_at, updated_at FROM miners WHERE id = ?1",
                params![miner_id],
                miner_from_row,
            )
            .optional()
            .map_err(|e| classify("get_miner", &e))?
            .map(RawMiner::into_record)
            .transpose()
        })
        .await
    }

    /// Returns every registered miner ordered by id.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the query fails.
    pub async fn list_miners(&self) -> Result<Vec<MinerRecord>> {
        self.run("list_miners", |conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT id, name, model, host, created_at, updated_at FROM miners ORDER BY id",
                )
                .map_err(|e| classify("list_miners", &e))?;
            let raw = stmt
                .query_map([], miner_from_row)
                .map_err(|e| classify("list_miners", &e))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| classify("list_miners", &e))?;
            raw.into_iter().map(RawMiner::into_record).collect()
        })
        .await
    }

    /// Deletes a miner together with all of its metrics and status rows.
    ///
    /// Returns `false` if no such miner existed.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the delete fails.
    #[instrument(skip(self), fields(operation = "delete_miner", backend = "sqlite"))]
    pub async fn delete_miner(&self, miner_id: &str) -> Result<bool> {
        let miner_id = miner_id.to_string();
        self.run("delete_miner", move |conn| {
            with_immediate_transaction(conn, |tx| {
                tx.execute("DELETE FROM miners WHERE id = ?1", params![miner_id])
                    .map(|n| n > 0)
                    .map_err(|e| classify("delete_miner", &e))
            })
        })
        .await
    }

    /// Writes one row per entry of `metrics`, all stamped with `timestamp`.
    ///
    /// Rows are inserted in key order inside one transaction: either every
    /// row persists or none does. Returns the number of rows written.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] for an empty miner id or a non-finite value
    /// - [`Error::Storage`] (permanent) if the miner is not registered
    /// - retryable storage errors once retries are exhausted
    #[instrument(
        skip(self, metrics),
        fields(operation = "save_metrics", backend = "sqlite", miner_id = %miner_id, count = metrics.len())
    )]
    pub async fn save_metrics(
        &self,
        miner_id: &str,
        metrics: &HashMap<String, f64>,
        timestamp: DateTime<Utc>,
    ) -> Result<usize> {
        validate_miner_id(miner_id)?;
        if let Some((key, value)) = metrics.iter().find(|(_, v)| !v.is_finite()) {
            return Err(Error::InvalidInput(format!(
                "metric '{key}' has non-finite value {value}"
            )));
        }
        if metrics.is_empty() {
            return Ok(0);
        }

        let rows: Vec<(String, f64, Option<&'static str>)> = metrics
            .iter()
            .collect::<BTreeMap<_, _>>()
            .into_iter()
            .map(|(key, value)| (key.clone(), *value, unit_for(key)))
            .collect();
        let miner_id = miner_id.to_string();
        let ts = format_timestamp(timestamp);

        self.run("save_metrics", move |conn| {
            with_immediate_transaction(conn, |tx| {
                let mut stmt = tx
                    .prepare_cached(
                        "INSERT INTO miner_metrics (miner_id, timestamp, metric_type, value, unit)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                    )
                    .map_err(|e| classify("save_metrics", &e))?;
                for (metric_type, value, unit) in &rows {
                    stmt.execute(params![miner_id, ts, metric_type, value, unit])
                        .map_err(|e| classify("save_metrics", &e))?;
                }
                Ok(rows.len())
            })
        })
        .await
    }

    /// Stores one status snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an empty miner id, or a storage
    /// error.
    #[instrument(skip(self, status), fields(operation = "save_status", backend = "sqlite", miner_id = %miner_id))]
    pub async fn save_status(
        &self,
        miner_id: &str,
        status: &JsonValue,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        validate_miner_id(miner_id)?;
        let payload = serde_json::to_string(status)
            .map_err(|e| Error::InvalidInput(format!("status is not serializable: {e}")))?;
        let miner_id = miner_id.to_string();
        let ts = format_timestamp(timestamp);

        self.run("save_status", move |conn| {
            with_immediate_transaction(conn, |tx| {
                tx.execute(
                    "INSERT INTO miner_status (miner_id, timestamp, status_data) VALUES (?1, ?2, ?3)",
                    params![miner_id, ts, payload],
                )
                .map_err(|e| classify("save_status", &e))?;
                Ok(())
            })
        })
        .await
    }

    /// Returns the newest sample of every metric type recorded for a miner.
    ///
    /// When two samples of a type share the newest timestamp, the one
    /// inserted last wins. An unknown miner yields an empty map.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the query fails.
    #[instrument(skip(self), fields(operation = "get_latest_metrics", backend = "sqlite"))]
    pub async fn get_latest_metrics(&self, miner_id: &str) -> Result<BTreeMap<String, LatestMetric>> {
        validate_miner_id(miner_id)?;
        let miner_id = miner_id.to_string();
        self.run("get_latest_metrics", move |conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT m.metric_type, m.value, m.unit, m.timestamp
                     FROM miner_metrics m
                     WHERE m.miner_id = ?1
                       AND m.id = (
                           SELECT l.id FROM miner_metrics l
                           WHERE l.miner_id = m.miner_id AND l.metric_type = m.metric_type
                           ORDER BY l.timestamp DESC, l.id DESC
                           LIMIT 1
                       )",
                )
                .map_err(|e| classify("get_latest_metrics", &e))?;
            let raw = stmt
                .query_map(params![miner_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })
                .map_err(|e| classify("get_latest_metrics", &e))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| classify("get_latest_metrics", &e))?;

            raw.into_iter()
                .map(|(metric_type, value, unit, ts)| {
                    let timestamp = decode_timestamp("get_latest_metrics", &ts)?;
                    Ok((
                        metric_type,
                        LatestMetric {
                            value,
                            unit,
                            timestamp,
                        },
                    ))
                })
                .collect()
        })
        .await
    }

    /// Returns the newest status snapshot, or `None` if the miner has none.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the query fails or the stored document is
    /// not valid JSON.
    #[instrument(skip(self), fields(operation = "get_latest_status", backend = "sqlite"))]
    pub async fn get_latest_status(&self, miner_id: &str) -> Result<Option<JsonValue>> {
        validate_miner_id(miner_id)?;
        let miner_id = miner_id.to_string();
        self.run("get_latest_status", move |conn| {
            let payload: Option<String> = conn
                .query_row(
                    "SELECT status_data FROM miner_status
                     WHERE miner_id = ?1
                     ORDER BY timestamp DESC, id DESC
                     LIMIT 1",
                    params![miner_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| classify("get_latest_status", &e))?;
            payload
                .map(|p| {
                    serde_json::from_str(&p)
                        .map_err(|e| decode_error("get_latest_status", &e.to_string()))
                })
                .transpose()
        })
        .await
    }

    /// Returns every sample with `start <= timestamp <= end`, ascending by
    /// timestamp and then insertion order.
    ///
    /// `metric_types` restricts the result to the listed keys; `None` or an
    /// empty slice means every key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if `start > end`, or a storage error.
    #[instrument(skip(self, metric_types), fields(operation = "get_metrics_raw", backend = "sqlite"))]
    pub async fn get_metrics_raw(
        &self,
        miner_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        metric_types: Option<&[String]>,
    ) -> Result<Vec<MetricPoint>> {
        let rows = self
            .range_rows("get_metrics_raw", miner_id, start, end, metric_types)
            .await?;
        rows.iter().map(|row| point_from_values(row)).collect()
    }

    /// Buckets samples in `[start, end]` into `interval`-wide windows and
    /// summarizes each `(bucket, metric_type)` cell.
    ///
    /// Buckets are epoch aligned and left-closed; empty buckets are omitted.
    /// Output is ordered by bucket start, then metric type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if `start > end`, or a storage error.
    #[instrument(
        skip(self, metric_types),
        fields(operation = "get_aggregated_metrics", backend = "sqlite", interval = %interval)
    )]
    pub async fn get_aggregated_metrics(
        &self,
        miner_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: Interval,
        metric_types: Option<&[String]>,
    ) -> Result<Vec<AggregateBucket>> {
        let rows = self
            .range_rows("get_aggregated_metrics", miner_id, start, end, metric_types)
            .await?;
        let points = rows
            .iter()
            .map(|row| point_from_values(row))
            .collect::<Result<Vec<_>>>()?;
        Ok(aggregate(&points, interval))
    }

    /// Deletes metric and status rows older than `retention_days` days.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if `retention_days` is zero or above
    /// [`MAX_RETENTION_DAYS`], or a storage error. On error nothing is deleted.
    pub async fn cleanup_old_metrics(&self, retention_days: u32) -> Result<CleanupReport> {
        if !(1..=MAX_RETENTION_DAYS).contains(&retention_days) {
            return Err(Error::InvalidInput(format!(
                "retention_days must be between 1 and {MAX_RETENTION_DAYS}, got {retention_days}"
            )));
        }
        let cutoff = ChronoDuration::try_days(i64::from(retention_days))
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .ok_or_else(|| {
                Error::InvalidInput(format!(
                    "retention window of {retention_days} days is out of range"
                ))
            })?;
        self.cleanup_before(cutoff).await
    }

    /// Deletes metric and status rows with `timestamp < cutoff` in one
    /// transaction.
    ///
    /// # Errors
    ///
    /// Returns a storage error; on error nothing is deleted.
    #[instrument(skip(self), fields(operation = "cleanup_old_metrics", backend = "sqlite", cutoff = %cutoff))]
    pub async fn cleanup_before(&self, cutoff: DateTime<Utc>) -> Result<CleanupReport> {
        let boundary = format_timestamp(cutoff);
        let report = self
            .run("cleanup_old_metrics", move |conn| {
                with_immediate_transaction(conn, |tx| {
                    let metrics_deleted = tx
                        .execute(
                            "DELETE FROM miner_metrics WHERE timestamp < ?1",
                            params![boundary],
                        )
                        .map_err(|e| classify("cleanup_metrics", &e))?;
                    let status_deleted = tx
                        .execute(
                            "DELETE FROM miner_status WHERE timestamp < ?1",
                            params![boundary],
                        )
                        .map_err(|e| classify("cleanup_status", &e))?;
                    Ok(CleanupReport {
                        cutoff,
                        metrics_deleted,
                        status_deleted,
                    })
                })
            })
            .await?;

        tracing::info!(
            metrics_deleted = report.metrics_deleted,
            status_deleted = report.status_deleted,
            "Retention cleanup complete"
        );
        metrics::counter!("retention_rows_deleted_total", "table" => "miner_metrics")
            .increment(report.metrics_deleted as u64);
        metrics::counter!("retention_rows_deleted_total", "table" => "miner_status")
            .increment(report.status_deleted as u64);
        Ok(report)
    }

    async fn range_rows(
        &self,
        operation: &'static str,
        miner_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        metric_types: Option<&[String]>,
    ) -> Result<Arc<CachedRows>> {
        validate_miner_id(miner_id)?;
        if start > end {
            return Err(Error::InvalidInput(format!(
                "range start {} is after end {}",
                format_timestamp(start),
                format_timestamp(end)
            )));
        }

        let mut sql = format!(
            "SELECT {RANGE_COLUMNS} FROM miner_metrics
             WHERE miner_id = ? AND timestamp >= ? AND timestamp <= ?"
        );
        let mut params = vec![
            Value::Text(miner_id.to_string()),
            Value::Text(format_timestamp(start)),
            Value::Text(format_timestamp(end)),
        ];
        if let Some(types) = metric_types.filter(|t| !t.is_empty()) {
            let placeholders = vec!["?"; types.len()].join(", ");
            sql.push_str(&format!(" AND metric_type IN ({placeholders})"));
            params.extend(types.iter().cloned().map(Value::Text));
        }
        sql.push_str(" ORDER BY timestamp ASC, id ASC");

        let key = CacheKey::new(&sql, &params);
        self.cache
            .get_or_compute(&key, self.cache_ttl, || {
                self.run(operation, move |conn| query_values(conn, operation, &sql, &params))
            })
            .await
    }

    /// Runs `f` on a pooled connection under the retry policy.
    async fn run<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        F: Fn(&Connection) -> Result<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let start = Instant::now();
        let f = Arc::new(f);
        let result = self
            .retry
            .execute(operation, Some(DATABASE_CIRCUIT), || {
                let pool = self.pool.clone();
                let f = Arc::clone(&f);
                async move {
                    let mut conn = pool.acquire().await?;
                    conn.interact(move |c| (*f)(&*c)).await
                }
            })
            .await;
        record_operation_metrics(operation, start, status_label(&result));
        result
    }
}

fn validate_miner_id(miner_id: &str) -> Result<()> {
    if miner_id.trim().is_empty() {
        return Err(Error::InvalidInput("miner_id must not be empty".to_string()));
    }
    Ok(())
}

fn decode_error(operation: &str, cause: &str) -> Error {
    Error::Storage {
        operation: operation.to_string(),
        cause: format!("undecodable row: {cause}"),
        transient: false,
    }
}

fn decode_timestamp(operation: &str, raw: &str) -> Result<DateTime<Utc>> {
    parse_timestamp(raw).map_err(|e| decode_error(operation, &e.to_string()))
}

fn query_values(
    conn: &Connection,
    operation: &str,
    sql: &str,
    params: &[Value],
) -> Result<CachedRows> {
    let mut stmt = conn.prepare_cached(sql).map_err(|e| classify(operation, &e))?;
    let columns = stmt.column_count();
    stmt.query_map(params_from_iter(params.iter()), |row| {
        (0..columns).map(|i| row.get::<_, Value>(i)).collect()
    })
    .map_err(|e| classify(operation, &e))?
    .collect::<rusqlite::Result<CachedRows>>()
    .map_err(|e| classify(operation, &e))
}

fn point_from_values(row: &[Value]) -> Result<MetricPoint> {
    const OP: &str = "decode_metric_point";
    let text = |i: usize| match row.get(i) {
        Some(Value::Text(s)) => Ok(s.clone()),
        other => Err(decode_error(OP, &format!("column {i} is {other:?}, expected text"))),
    };
    let id = match row.first() {
        Some(Value::Integer(id)) => *id,
        other => return Err(decode_error(OP, &format!("id is {other:?}"))),
    };
    #[allow(clippy::cast_precision_loss)]
    let value = match row.get(4) {
        Some(Value::Real(v)) => *v,
        Some(Value::Integer(v)) => *v as f64,
        other => return Err(decode_error(OP, &format!("value is {other:?}"))),
    };
    let unit = match row.get(5) {
        Some(Value::Text(u)) => Some(u.clone()),
        Some(Value::Null) | None => None,
        other => return Err(decode_error(OP, &format!("unit is {other:?}"))),
    };
    Ok(MetricPoint {
        id,
        miner_id: text(1)?,
        timestamp: decode_timestamp(OP, &text(2)?)?,
        metric_type: text(3)?,
        value,
        unit,
    })
}

struct RawMiner {
    id: String,
    name: String,
    model: Option<String>,
    host: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawMiner {
    fn into_record(self) -> Result<MinerRecord> {
        Ok(MinerRecord {
            id: self.id,
            name: self.name,
            model: self.model,
            host: self.host,
            created_at: decode_timestamp("decode_miner", &self.created_at)?,
            updated_at: decode_timestamp("decode_miner", &self.updated_at)?,
        })
    }
}

fn miner_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawMiner> {
    Ok(RawMiner {
        id: row.get(0)?,
        name: row.get(1)?,
        model: row.get(2)?,
        host: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{CircuitState, RetryConfig};
    use crate::storage::{CacheConfig, DatabaseTarget, PoolConfig};
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: TimeSeriesStore,
        registry: Arc<CircuitBreakerRegistry>,
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig::default()
            .with_max_attempts(2)
            .with_delays(Duration::from_millis(1), Duration::from_millis(5))
            .with_jitter(false)
            .with_failure_threshold(3)
    }

    fn store_at(target: DatabaseTarget, dir: TempDir, cache_ttl: Duration) -> Fixture {
        let registry = Arc::new(CircuitBreakerRegistry::new());
        let pool = ConnectionPool::new(target, PoolConfig::default().with_max_connections(4))
            .unwrap();
        let cache = Arc::new(QueryCache::new(CacheConfig {
            default_ttl: cache_ttl,
            ..CacheConfig::default()
        }));
        let retry = Arc::new(RetryPolicy::new(fast_retry(), Arc::clone(&registry)));
        Fixture {
            _dir: dir,
            store: TimeSeriesStore::new(pool, cache, retry),
            registry,
        }
    }

    async fn fixture_with_ttl(cache_ttl: Duration) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let target = DatabaseTarget::File(dir.path().join("hashwatch.db"));
        let fx = store_at(target, dir, cache_ttl);
        fx.store.initialize().await.unwrap();
        fx.store.ensure_miner("m1").await.unwrap();
        fx
    }

    async fn fixture() -> Fixture {
        fixture_with_ttl(Duration::ZERO).await
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap()
    }

    fn minutes(n: i64) -> ChronoDuration {
        ChronoDuration::minutes(n)
    }

    fn sample(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), *v)).collect()
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let fx = fixture().await;
        assert_eq!(fx.store.initialize().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_save_then_latest_metrics() {
        let fx = fixture().await;
        let written = fx
            .store
            .save_metrics("m1", &sample(&[("hashrate", 500.0), ("temperature", 65.5)]), t0())
            .await
            .unwrap();
        assert_eq!(written, 2);

        let latest = fx.store.get_latest_metrics("m1").await.unwrap();
        assert_eq!(latest.len(), 2);
        assert!((latest["hashrate"].value - 500.0).abs() < f64::EPSILON);
        assert_eq!(latest["hashrate"].unit.as_deref(), Some("TH/s"));
        assert!((latest["temperature"].value - 65.5).abs() < f64::EPSILON);
        assert_eq!(latest["temperature"].unit.as_deref(), Some("°C"));
        assert_eq!(latest["hashrate"].timestamp, t0());
    }

    #[tokio::test]
    async fn test_latest_picks_newest_timestamp_per_type() {
        let fx = fixture().await;
        let s = &fx.store;
        s.save_metrics("m1", &sample(&[("hashrate", 400.0), ("power", 15.0)]), t0())
            .await
            .unwrap();
        s.save_metrics("m1", &sample(&[("hashrate", 450.0)]), t0() + minutes(5))
            .await
            .unwrap();
        // Older sample written last must not win
        s.save_metrics("m1", &sample(&[("hashrate", 1.0)]), t0() - minutes(5))
            .await
            .unwrap();

        let latest = s.get_latest_metrics("m1").await.unwrap();
        assert!((latest["hashrate"].value - 450.0).abs() < f64::EPSILON);
        assert!((latest["power"].value - 15.0).abs() < f64::EPSILON);
        assert_eq!(latest["power"].timestamp, t0());
    }

    #[tokio::test]
    async fn test_latest_tie_break_is_last_inserted() {
        let fx = fixture().await;
        let s = &fx.store;
        s.save_metrics("m1", &sample(&[("hashrate", 100.0)]), t0()).await.unwrap();
        s.save_metrics("m1", &sample(&[("hashrate", 200.0)]), t0()).await.unwrap();

        let latest = s.get_latest_metrics("m1").await.unwrap();
        assert!((latest["hashrate"].value - 200.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_latest_for_unknown_miner_is_empty() {
        let fx = fixture().await;
        assert!(fx.store.get_latest_metrics("nobody").await.unwrap().is_empty());
        assert!(fx.store.get_latest_status("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_status_round_trip_and_tie_break() {
        let fx = fixture().await;
        let s = &fx.store;
        assert!(s.get_latest_status("m1").await.unwrap().is_none());

        s.save_status("m1", &json!({"state": "mining", "uptime": 10}), t0())
            .await
            .unwrap();
        s.save_status("m1", &json!({"state": "idle"}), t0() - minutes(1))
            .await
            .unwrap();
        assert_eq!(
            s.get_latest_status("m1").await.unwrap(),
            Some(json!({"state": "mining", "uptime": 10}))
        );

        s.save_status("m1", &json!({"state": "restarting"}), t0()).await.unwrap();
        assert_eq!(
            s.get_latest_status("m1").await.unwrap(),
            Some(json!({"state": "restarting"}))
        );
    }

    #[tokio::test]
    async fn test_raw_range_is_inclusive_and_ordered() {
        let fx = fixture().await;
        let s = &fx.store;
        for (i, offset) in [0, 10, 20].into_iter().enumerate() {
            #[allow(clippy::cast_precision_loss)]
            let v = i as f64;
            s.save_metrics(
                "m1",
                &sample(&[("hashrate", 500.0 + v), ("temperature", 60.0 + v)]),
                t0() + minutes(offset),
            )
            .await
            .unwrap();
        }

        let rows = s
            .get_metrics_raw("m1", t0(), t0() + minutes(30), None)
            .await
            .unwrap();
        assert_eq!(rows.len(), 6);
        assert!(rows.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(rows[0].timestamp, t0());

        let edge = s
            .get_metrics_raw("m1", t0() + minutes(10), t0() + minutes(20), None)
            .await
            .unwrap();
        assert_eq!(edge.len(), 4, "both range ends are inclusive");
    }

    #[tokio::test]
    async fn test_raw_filter_by_metric_type() {
        let fx = fixture().await;
        let s = &fx.store;
        s.save_metrics(
            "m1",
            &sample(&[("hashrate", 1.0), ("temperature", 2.0), ("power", 3.0)]),
            t0(),
        )
        .await
        .unwrap();

        let only = vec!["power".to_string(), "hashrate".to_string()];
        let rows = s
            .get_metrics_raw("m1", t0(), t0(), Some(only.as_slice()))
            .await
            .unwrap();
        let mut types: Vec<_> = rows.iter().map(|p| p.metric_type.as_str()).collect();
        types.sort_unstable();
        assert_eq!(types, vec!["hashrate", "power"]);

        let all = s.get_metrics_raw("m1", t0(), t0(), Some(&[][..])).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_aggregate_four_samples_into_one_hour_bucket() {
        let fx = fixture().await;
        let s = &fx.store;
        let values = [480.0, 500.0, 510.0, 530.0];
        for (i, v) in values.iter().enumerate() {
            let offset = i64::try_from(i).unwrap() * 15;
            s.save_metrics(
                "m1",
                &sample(&[("hashrate", *v), ("temperature", 60.0)]),
                t0() + minutes(offset),
            )
            .await
            .unwrap();
        }

        let buckets = s
            .get_aggregated_metrics("m1", t0(), t0() + minutes(45), Interval::HOUR, None)
            .await
            .unwrap();
        assert_eq!(buckets.len(), 2);
        let hashrate = buckets.iter().find(|b| b.metric_type == "hashrate").unwrap();
        assert_eq!(hashrate.sample_count, 4);
        assert!((hashrate.avg_value - 505.0).abs() < 1e-9);
        assert!((hashrate.min_value - 480.0).abs() < f64::EPSILON);
        assert!((hashrate.max_value - 530.0).abs() < f64::EPSILON);
        assert_eq!(hashrate.time_bucket, t0());
        assert_eq!(hashrate.unit.as_deref(), Some("TH/s"));
    }

    #[tokio::test]
    async fn test_aggregate_boundary_sample_starts_new_bucket() {
        let fx = fixture().await;
        let s = &fx.store;
        s.save_metrics("m1", &sample(&[("power", 10.0)]), t0() + minutes(59))
            .await
            .unwrap();
        s.save_metrics("m1", &sample(&[("power", 20.0)]), t0() + minutes(60))
            .await
            .unwrap();
        s.save_metrics("m1", &sample(&[("power", 30.0)]), t0() + minutes(180))
            .await
            .unwrap();

        let buckets = s
            .get_aggregated_metrics("m1", t0(), t0() + minutes(240), Interval::HOUR, None)
            .await
            .unwrap();
        let starts: Vec<_> = buckets.iter().map(|b| b.time_bucket).collect();
        assert_eq!(starts, vec![t0(), t0() + minutes(60), t0() + minutes(180)]);
        assert!(buckets.iter().all(|b| b.sample_count == 1));
    }

    #[tokio::test]
    async fn test_cleanup_respects_retention_window() {
        let fx = fixture().await;
        let s = &fx.store;
        let now = Utc::now();
        s.save_metrics("m1", &sample(&[("hashrate", 1.0)]), now - ChronoDuration::days(35))
            .await
            .unwrap();
        s.save_metrics("m1", &sample(&[("hashrate", 2.0)]), now - ChronoDuration::hours(1))
            .await
            .unwrap();
        s.save_status("m1", &json!({"old": true}), now - ChronoDuration::days(35))
            .await
            .unwrap();

        let report = s.cleanup_old_metrics(30).await.unwrap();
        assert_eq!(report.metrics_deleted, 1);
        assert_eq!(report.status_deleted, 1);
        assert_eq!(report.total_deleted(), 2);

        let remaining = s
            .get_metrics_raw("m1", now - ChronoDuration::days(60), now, None)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert!((remaining[0].value - 2.0).abs() < f64::EPSILON);
        assert!(s.get_latest_status("m1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cleanup_rejects_zero_days() {
        let fx = fixture().await;
        assert!(matches!(
            fx.store.cleanup_old_metrics(0).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_cleanup_rejects_huge_window_without_deleting() {
        let fx = fixture().await;
        fx.store
            .save_metrics("m1", &sample(&[("hashrate", 1.0)]), Utc::now())
            .await
            .unwrap();

        for days in [MAX_RETENTION_DAYS + 1, 200_000_000, u32::MAX] {
            assert!(matches!(
                fx.store.cleanup_old_metrics(days).await,
                Err(Error::InvalidInput(_))
            ));
        }
        let report = fx.store.cleanup_old_metrics(MAX_RETENTION_DAYS).await.unwrap();
        assert_eq!(report.total_deleted(), 0);
    }

    #[tokio::test]
    async fn test_save_is_all_or_nothing() {
        let fx = fixture().await;
        fx.store
            .pool()
            .with_connection(|c| {
                c.execute_batch(
                    "CREATE TRIGGER reject_boom BEFORE INSERT ON miner_metrics
                     WHEN NEW.metric_type = 'boom'
                     BEGIN SELECT RAISE(ABORT, 'boom rejected'); END;",
                )
                .map_err(|e| classify("create_trigger", &e))
            })
            .await
            .unwrap();

        // `a_first` sorts before `boom` and is inserted before the failure
        let err = fx
            .store
            .save_metrics("m1", &sample(&[("a_first", 1.0), ("boom", 2.0)]), t0())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());

        let rows = fx.store.get_metrics_raw("m1", t0(), t0(), None).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_miner_is_permanent_error() {
        let fx = fixture().await;
        let err = fx
            .store
            .save_metrics("ghost", &sample(&[("hashrate", 1.0)]), t0())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage { transient: false, .. }));
        assert_eq!(fx.registry.state(DATABASE_CIRCUIT), Some(CircuitState::Closed));
    }

    #[tokio::test]
    async fn test_input_validation() {
        let fx = fixture().await;
        let s = &fx.store;
        assert!(matches!(
            s.save_metrics("m1", &sample(&[("hashrate", f64::NAN)]), t0()).await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            s.save_metrics("", &sample(&[("hashrate", 1.0)]), t0()).await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            s.get_metrics_raw("m1", t0() + minutes(1), t0(), None).await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            s.get_aggregated_metrics("m1", t0() + minutes(1), t0(), Interval::HOUR, None)
                .await,
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(s.save_metrics("m1", &HashMap::new(), t0()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cached_range_read_is_stale_until_ttl() {
        let fx = fixture_with_ttl(Duration::from_secs(60)).await;
        let s = &fx.store;
        s.save_metrics("m1", &sample(&[("hashrate", 1.0)]), t0()).await.unwrap();
        let first = s.get_metrics_raw("m1", t0(), t0() + minutes(10), None).await.unwrap();
        assert_eq!(first.len(), 1);

        s.save_metrics("m1", &sample(&[("hashrate", 2.0)]), t0() + minutes(5))
            .await
            .unwrap();
        let cached = s.get_metrics_raw("m1", t0(), t0() + minutes(10), None).await.unwrap();
        assert_eq!(cached.len(), 1, "writes do not invalidate cached reads");

        let fresh = s
            .clone()
            .with_cache_ttl(Duration::ZERO)
            .get_metrics_raw("m1", t0(), t0() + minutes(10), None)
            .await
            .unwrap();
        assert_eq!(fresh.len(), 2);
        assert_eq!(s.cache().stats().hits, 1);
    }

    #[tokio::test]
    async fn test_miner_registry_and_cascade() {
        let fx = fixture().await;
        let s = &fx.store;
        let record = MinerRecord::new("bitaxe-1", "Garage Bitaxe")
            .with_model("Bitaxe Gamma")
            .with_host("192.168.1.40");
        s.upsert_miner(&record).await.unwrap();

        let mut renamed = record.clone();
        renamed.name = "Office Bitaxe".to_string();
        renamed.created_at = record.created_at + ChronoDuration::days(1);
        s.upsert_miner(&renamed).await.unwrap();

        let stored = s.get_miner("bitaxe-1").await.unwrap().unwrap();
        assert_eq!(stored.name, "Office Bitaxe");
        assert_eq!(stored.model.as_deref(), Some("Bitaxe Gamma"));
        assert_eq!(
            format_timestamp(stored.created_at),
            format_timestamp(record.created_at)
        );

        let ids: Vec<_> = s.list_miners().await.unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["bitaxe-1", "m1"]);
        assert!(!s.ensure_miner("bitaxe-1").await.unwrap());

        s.save_metrics("bitaxe-1", &sample(&[("hashrate", 1.2)]), t0()).await.unwrap();
        s.save_status("bitaxe-1", &json!({}), t0()).await.unwrap();
        assert!(s.delete_miner("bitaxe-1").await.unwrap());
        assert!(!s.delete_miner("bitaxe-1").await.unwrap());
        assert!(s.get_miner("bitaxe-1").await.unwrap().is_none());
        assert!(s.get_latest_metrics("bitaxe-1").await.unwrap().is_empty());
        assert!(s.get_latest_status("bitaxe-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unreachable_database_opens_circuit() {
        let dir = tempfile::tempdir().unwrap();
        let target = DatabaseTarget::File(dir.path().join("missing").join("hashwatch.db"));
        let fx = store_at(target, dir, Duration::ZERO);

        // Two attempts per call, threshold of three: the second call trips it
        let first = fx.store.get_latest_metrics("m1").await.unwrap_err();
        assert!(matches!(first, Error::Connection { .. }));
        let second = fx.store.get_latest_metrics("m1").await.unwrap_err();
        assert!(second.is_retryable());
        assert_eq!(fx.registry.state(DATABASE_CIRCUIT), Some(CircuitState::Open));

        let third = fx.store.get_latest_metrics("m1").await.unwrap_err();
        assert!(matches!(third, Error::CircuitOpen { ref circuit } if circuit == DATABASE_CIRCUIT));
    }

    #[tokio::test]
    async fn test_closed_pool_is_not_retried() {
        let fx = fixture().await;
        fx.store.pool().close_all();
        assert!(matches!(
            fx.store.get_latest_metrics("m1").await,
            Err(Error::PoolClosed)
        ));
    }
}
