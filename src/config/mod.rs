//! Configuration management.
//!
//! Settings come from three layers, later layers winning:
//!
//! 1. Built-in defaults ([`MonitorConfig::default`])
//! 2. A TOML file (`HASHWATCH_CONFIG_PATH`, or `hashwatch/config.toml` under
//!    the platform config dir)
//! 3. `HASHWATCH_*` environment variables ([`MonitorConfig::with_env_overrides`])
//!
//! ```toml
//! [database]
//! path = "/var/lib/hashwatch/hashwatch.db"
//! max_connections = 5
//!
//! [cache]
//! ttl_secs = 30
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 1000
//!
//! [retention]
//! days = 30
//!
//! [observability.logging]
//! format = "json"
//!
//! [[miners]]
//! id = "bitaxe-1"
//! name = "Garage Bitaxe"
//! host = "192.168.1.50"
//! ```

use crate::models::{MAX_RETENTION_DAYS, MinerRecord};
use crate::resilience::RetryConfig;
use crate::storage::{CacheConfig, DatabaseTarget, PoolConfig, get_user_data_dir};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "HASHWATCH_CONFIG_PATH";

/// File name of the database inside the user data directory.
const DEFAULT_DATABASE_FILE: &str = "hashwatch.db";

/// Main configuration for hashwatch.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// Database location and pool tunables.
    pub database: DatabaseSettings,
    /// Range-query cache tunables.
    pub cache: CacheConfig,
    /// Retry and circuit breaker tunables shared by the store and miners.
    pub retry: RetryConfig,
    /// Retention window and sweep period.
    pub retention: RetentionSettings,
    /// Logging and metrics settings, resolved by [`crate::observability`].
    pub observability: ObservabilitySettings,
    /// Miners registered on `init`.
    pub miners: Vec<MinerSeed>,
}

/// Database settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseSettings {
    /// Database file. `None` means `<user data dir>/hashwatch.db`.
    pub path: Option<PathBuf>,
    /// Pool size.
    pub max_connections: usize,
    /// Idle-connection health check period.
    pub health_check_interval: Duration,
    /// Checkout deadline. `None` waits forever.
    pub acquire_timeout: Option<Duration>,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        let pool = PoolConfig::default();
        Self {
            path: None,
            max_connections: pool.max_connections,
            health_check_interval: pool.health_check_interval,
            acquire_timeout: pool.acquire_timeout,
        }
    }
}

/// Retention settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionSettings {
    /// Samples older than this many days are deleted.
    pub days: u32,
    /// Period of the background retention sweep.
    pub sweep_interval: Duration,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            days: 30,
            sweep_interval: Duration::from_secs(3600),
        }
    }
}

/// Observability section (`[observability]`).
///
/// Fields stay optional; [`crate::observability`] fills in defaults and
/// applies its own env overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ObservabilitySettings {
    /// `[observability.logging]`.
    pub logging: Option<LoggingSettings>,
    /// `[observability.metrics]`.
    pub metrics: Option<MetricsSettings>,
}

/// Logging section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct LoggingSettings {
    /// `json` or `pretty`.
    pub format: Option<String>,
    /// Filter directive, e.g. `info` or `hashwatch=debug`.
    pub level: Option<String>,
    /// Log file; stderr when unset.
    pub file: Option<String>,
}

/// Metrics section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct MetricsSettings {
    /// Install the Prometheus recorder.
    pub enabled: Option<bool>,
    /// Port of the scrape listener.
    pub port: Option<u16>,
}

/// A miner listed in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MinerSeed {
    /// Stable identifier.
    pub id: String,
    /// Display name; defaults to the id.
    pub name: Option<String>,
    /// Hardware model.
    pub model: Option<String>,
    /// Polled host.
    pub host: Option<String>,
}

impl MinerSeed {
    /// Converts the seed into a record stamped with the current time.
    #[must_use]
    pub fn to_record(&self) -> MinerRecord {
        let mut record =
            MinerRecord::new(&self.id, self.name.clone().unwrap_or_else(|| self.id.clone()));
        record.model.clone_from(&self.model);
        record.host.clone_from(&self.host);
        record
    }
}

/// Configuration file structure (for TOML parsing).
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// `[database]`.
    pub database: Option<ConfigFileDatabase>,
    /// `[cache]`.
    pub cache: Option<ConfigFileCache>,
    /// `[retry]`.
    pub retry: Option<ConfigFileRetry>,
    /// `[retention]`.
    pub retention: Option<ConfigFileRetention>,
    /// `[observability]`.
    pub observability: Option<ObservabilitySettings>,
    /// `[[miners]]`.
    #[serde(default)]
    pub miners: Vec<MinerSeed>,
}

/// Database section in config file.
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileDatabase {
    /// Database file path; `~` expands to the home directory.
    pub path: Option<String>,
    /// Pool size.
    pub max_connections: Option<usize>,
    /// Health check period in seconds.
    pub health_check_interval_secs: Option<u64>,
    /// Checkout deadline in milliseconds; `0` waits forever.
    pub acquire_timeout_ms: Option<u64>,
}

/// Cache section in config file.
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileCache {
    /// Range-read TTL in seconds; `0` disables caching.
    pub ttl_secs: Option<u64>,
    /// Entry cap.
    pub max_entries: Option<usize>,
    /// Sweep period in seconds.
    pub sweep_interval_secs: Option<u64>,
}

/// Retry section in config file.
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileRetry {
    /// Attempts per call, including the first.
    pub max_attempts: Option<u32>,
    /// First backoff delay in milliseconds.
    pub base_delay_ms: Option<u64>,
    /// Backoff ceiling in milliseconds.
    pub max_delay_ms: Option<u64>,
    /// Backoff growth factor.
    pub exponential_base: Option<f64>,
    /// Randomize delays.
    pub jitter: Option<bool>,
    /// Consecutive failures that open a circuit.
    pub failure_threshold: Option<u32>,
    /// Open-state duration in milliseconds.
    pub recovery_timeout_ms: Option<u64>,
    /// Concurrent trial calls while half-open.
    pub half_open_max_calls: Option<u32>,
    /// Per-attempt deadline in milliseconds; `0` disables it.
    pub attempt_timeout_ms: Option<u64>,
}

/// Retention section in config file.
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileRetention {
    /// Retention window in days.
    pub days: Option<u32>,
    /// Sweep period in seconds.
    pub sweep_interval_secs: Option<u64>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            database: DatabaseSettings::default(),
            cache: CacheConfig::default(),
            retry: RetryConfig::default(),
            retention: RetentionSettings::default(),
            observability: ObservabilitySettings::default(),
            miners: Vec::new(),
        }
    }
}

impl MonitorConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid TOML or names unknown keys.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(contents).map_err(|e| Error::OperationFailed {
            operation: "parse_config_file".to_string(),
            cause: e.to_string(),
        })?;
        Ok(Self::from_config_file(file))
    }

    /// Loads configuration from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::OperationFailed {
            operation: "read_config_file".to_string(),
            cause: format!("{}: {e}", path.display()),
        })?;
        Self::from_toml_str(&contents)
    }

    /// Loads configuration from the default location.
    ///
    /// Checks the following paths in order:
    /// 1. `HASHWATCH_CONFIG_PATH`
    /// 2. Platform-specific config dir (`~/Library/Application Support/hashwatch/` on macOS)
    /// 3. XDG config dir (`~/.config/hashwatch/`)
    ///
    /// Returns default configuration if no config file is found. A file that
    /// exists but does not parse is logged and skipped.
    #[must_use]
    pub fn load_default() -> Self {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            match Self::load_from_file(Path::new(&path)) {
                Ok(config) => return config,
                Err(e) => tracing::warn!(path = %path, error = %e, "Ignoring config file"),
            }
        }

        let Some(base_dirs) = directories::BaseDirs::new() else {
            return Self::default();
        };

        let candidates = [
            base_dirs.config_dir().join("hashwatch").join("config.toml"),
            base_dirs
                .home_dir()
                .join(".config")
                .join("hashwatch")
                .join("config.toml"),
        ];
        for candidate in candidates.iter().filter(|p| p.exists()) {
            match Self::load_from_file(candidate) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!(path = %candidate.display(), error = %e, "Ignoring config file");
                },
            }
        }

        Self::default()
    }

    /// Converts a `ConfigFile` to `MonitorConfig`.
    fn from_config_file(file: ConfigFile) -> Self {
        let mut config = Self::default();

        if let Some(db) = file.database {
            if let Some(path) = db.path {
                config.database.path = Some(expand_home(&path));
            }
            if let Some(max) = db.max_connections {
                config.database.max_connections = max;
            }
            if let Some(secs) = db.health_check_interval_secs {
                config.database.health_check_interval = Duration::from_secs(secs);
            }
            if let Some(ms) = db.acquire_timeout_ms {
                config.database.acquire_timeout = (ms > 0).then(|| Duration::from_millis(ms));
            }
        }

        if let Some(cache) = file.cache {
            if let Some(secs) = cache.ttl_secs {
                config.cache.default_ttl = Duration::from_secs(secs);
            }
            if let Some(max) = cache.max_entries {
                config.cache.max_entries = max;
            }
            if let Some(secs) = cache.sweep_interval_secs {
                config.cache.sweep_interval = Duration::from_secs(secs);
            }
        }

        if let Some(retry) = file.retry {
            apply_retry_section(&mut config.retry, retry);
        }

        if let Some(retention) = file.retention {
            if let Some(days) = retention.days {
                config.retention.days = days;
            }
            if let Some(secs) = retention.sweep_interval_secs {
                config.retention.sweep_interval = Duration::from_secs(secs);
            }
        }

        if let Some(observability) = file.observability {
            config.observability = observability;
        }
        config.miners = file.miners;

        config
    }

    /// Applies `HASHWATCH_*` environment variable overrides.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `HASHWATCH_DATABASE_PATH` | `database.path` |
    /// | `HASHWATCH_MAX_CONNECTIONS` | `database.max_connections` |
    /// | `HASHWATCH_CACHE_TTL_SECS` | `cache.default_ttl` |
    /// | `HASHWATCH_RETENTION_DAYS` | `retention.days` |
    /// | `HASHWATCH_RETRY_*`, `HASHWATCH_BREAKER_*` | see [`RetryConfig::with_env_overrides`] |
    ///
    /// Unparseable values are ignored.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        let mut config = self.with_overrides_from(|key| std::env::var(key).ok());
        config.retry = config.retry.with_env_overrides();
        config
    }

    /// Applies overrides read through `lookup` instead of the process
    /// environment.
    #[must_use]
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("HASHWATCH_DATABASE_PATH").filter(|p| !p.trim().is_empty()) {
            self.database.path = Some(expand_home(path.trim()));
        }
        if let Some(max) = parse_with(&lookup, "HASHWATCH_MAX_CONNECTIONS") {
            self.database.max_connections = max;
        }
        if let Some(secs) = parse_with(&lookup, "HASHWATCH_CACHE_TTL_SECS") {
            self.cache.default_ttl = Duration::from_secs(secs);
        }
        if let Some(days) = parse_with(&lookup, "HASHWATCH_RETENTION_DAYS") {
            self.retention.days = days;
        }
        self
    }

    /// Sets the database file.
    #[must_use]
    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database.path = Some(path.into());
        self
    }

    /// Sets the pool size.
    #[must_use]
    pub const fn with_max_connections(mut self, max: usize) -> Self {
        self.database.max_connections = max;
        self
    }

    /// Sets the retry tunables.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the retention window.
    #[must_use]
    pub const fn with_retention_days(mut self, days: u32) -> Self {
        self.retention.days = days;
        self
    }

    /// Checks every tunable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] naming the first invalid value.
    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        if self.database.max_connections == 0 {
            return Err(Error::InvalidInput(
                "database.max_connections must be at least 1".to_string(),
            ));
        }
        if self.cache.max_entries == 0 {
            return Err(Error::InvalidInput(
                "cache.max_entries must be at least 1".to_string(),
            ));
        }
        if !(1..=MAX_RETENTION_DAYS).contains(&self.retention.days) {
            return Err(Error::InvalidInput(format!(
                "retention.days must be between 1 and {MAX_RETENTION_DAYS}"
            )));
        }
        for (name, period) in [
            ("database.health_check_interval", self.database.health_check_interval),
            ("cache.sweep_interval", self.cache.sweep_interval),
            ("retention.sweep_interval", self.retention.sweep_interval),
        ] {
            if period.is_zero() {
                return Err(Error::InvalidInput(format!("{name} must be non-zero")));
            }
        }
        if let Some(seed) = self.miners.iter().find(|m| m.id.trim().is_empty()) {
            return Err(Error::InvalidInput(format!(
                "miner seed {:?} has an empty id",
                seed.name
            )));
        }
        Ok(())
    }

    /// Retry tunables for the store and miner clients.
    #[must_use]
    pub fn retry_config(&self) -> RetryConfig {
        self.retry.clone()
    }

    /// Pool tunables.
    #[must_use]
    pub const fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.database.max_connections,
            health_check_interval: self.database.health_check_interval,
            acquire_timeout: self.database.acquire_timeout,
        }
    }

    /// Cache tunables.
    #[must_use]
    pub fn cache_config(&self) -> CacheConfig {
        self.cache.clone()
    }

    /// Resolved database file: the configured path, or `hashwatch.db` in
    /// the user data directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OperationFailed`] if no path is configured and the
    /// user data directory cannot be determined.
    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.database.path {
            Some(path) => Ok(path.clone()),
            None => Ok(get_user_data_dir()?.join(DEFAULT_DATABASE_FILE)),
        }
    }

    /// Database target for the pool.
    ///
    /// Falls back to `./hashwatch.db` when neither a path nor a user data
    /// directory is available.
    #[must_use]
    pub fn database_target(&self) -> DatabaseTarget {
        let path = self.database_path().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Using database in the working directory");
            PathBuf::from(DEFAULT_DATABASE_FILE)
        });
        DatabaseTarget::File(path)
    }
}

fn apply_retry_section(retry: &mut RetryConfig, section: ConfigFileRetry) {
    if let Some(v) = section.max_attempts {
        retry.max_attempts = v;
    }
    if let Some(ms) = section.base_delay_ms {
        retry.base_delay = Duration::from_millis(ms);
    }
    if let Some(ms) = section.max_delay_ms {
        retry.max_delay = Duration::from_millis(ms);
    }
    if let Some(v) = section.exponential_base {
        retry.exponential_base = v;
    }
    if let Some(v) = section.jitter {
        retry.jitter = v;
    }
    if let Some(v) = section.failure_threshold {
        retry.failure_threshold = v;
    }
    if let Some(ms) = section.recovery_timeout_ms {
        retry.recovery_timeout = Duration::from_millis(ms);
    }
    if let Some(v) = section.half_open_max_calls {
        retry.half_open_max_calls = v;
    }
    if let Some(ms) = section.attempt_timeout_ms {
        retry.attempt_timeout = (ms > 0).then(|| Duration::from_millis(ms));
    }
}

fn parse_with<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|v| v.trim().parse().ok())
}

/// Expands a leading `~/` to the home directory.
fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(base_dirs) = directories::BaseDirs::new() {
            return base_dirs.home_dir().join(rest);
        }
    }
    PathBuf::from(path)
}
