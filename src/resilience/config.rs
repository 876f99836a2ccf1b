//! Retry and circuit breaker tunables.

use crate::{Error, Result};
use std::time::Duration;

/// Retry and circuit breaker configuration.
///
/// Immutable once handed to a [`RetryPolicy`](super::RetryPolicy); build a new
/// config per call site when different tunables are needed.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first call.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound on any single backoff delay.
    pub max_delay: Duration,
    /// Growth factor applied per attempt.
    pub exponential_base: f64,
    /// Whether to randomize delays.
    pub jitter: bool,
    /// Consecutive failures before a circuit opens.
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before allowing a trial.
    pub recovery_timeout: Duration,
    /// Trial calls admitted while half-open.
    pub half_open_max_calls: u32,
    /// Deadline for a single attempt. `None` disables it.
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: true,
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
            attempt_timeout: None,
        }
    }
}

impl RetryConfig {
    /// Loads the configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Applies environment variable overrides.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `HASHWATCH_RETRY_MAX_ATTEMPTS` | `max_attempts` |
    /// | `HASHWATCH_RETRY_BASE_DELAY_MS` | `base_delay` |
    /// | `HASHWATCH_RETRY_MAX_DELAY_MS` | `max_delay` |
    /// | `HASHWATCH_RETRY_EXPONENTIAL_BASE` | `exponential_base` |
    /// | `HASHWATCH_RETRY_JITTER` | `jitter` |
    /// | `HASHWATCH_BREAKER_FAILURE_THRESHOLD` | `failure_threshold` |
    /// | `HASHWATCH_BREAKER_RECOVERY_MS` | `recovery_timeout` |
    ///
    /// Unparseable values are ignored.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_parse::<u32>("HASHWATCH_RETRY_MAX_ATTEMPTS") {
            self.max_attempts = v.max(1);
        }
        if let Some(v) = env_parse::<u64>("HASHWATCH_RETRY_BASE_DELAY_MS") {
            self.base_delay = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>("HASHWATCH_RETRY_MAX_DELAY_MS") {
            self.max_delay = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<f64>("HASHWATCH_RETRY_EXPONENTIAL_BASE") {
            self.exponential_base = v;
        }
        if let Ok(v) = std::env::var("HASHWATCH_RETRY_JITTER") {
            self.jitter = v.eq_ignore_ascii_case("true") || v == "1";
        }
        if let Some(v) = env_parse::<u32>("HASHWATCH_BREAKER_FAILURE_THRESHOLD") {
            self.failure_threshold = v.max(1);
        }
        if let Some(v) = env_parse::<u64>("HASHWATCH_BREAKER_RECOVERY_MS") {
            self.recovery_timeout = Duration::from_millis(v);
        }
        self
    }

    /// Sets the maximum number of attempts.
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base and maximum delay.
    #[must_use]
    pub const fn with_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max;
        self
    }

    /// Sets the exponential growth factor.
    #[must_use]
    pub const fn with_exponential_base(mut self, base: f64) -> Self {
        self.exponential_base = base;
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub const fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Sets the circuit breaker failure threshold.
    #[must_use]
    pub const fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Sets the circuit breaker recovery timeout.
    #[must_use]
    pub const fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    /// Sets the per-attempt deadline.
    #[must_use]
    pub const fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Checks the invariants between fields.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] naming the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts < 1 {
            return Err(invalid("max_attempts must be at least 1"));
        }
        if self.base_delay.is_zero() {
            return Err(invalid("base_delay must be positive"));
        }
        if self.max_delay < self.base_delay {
            return Err(invalid("max_delay must be >= base_delay"));
        }
        if !self.exponential_base.is_finite() || self.exponential_base <= 1.0 {
            return Err(invalid("exponential_base must be > 1"));
        }
        if self.failure_threshold < 1 {
            return Err(invalid("failure_threshold must be at least 1"));
        }
        if self.half_open_max_calls < 1 {
            return Err(invalid("half_open_max_calls must be at least 1"));
        }
        Ok(())
    }

    /// Backoff delay after the given failed attempt (1-based), before jitter.
    ///
    /// `min(max_delay, base_delay * exponential_base^(attempt - 1))`.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.exponential_base.powi(exponent);
        let max = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= max {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Applies jitter to a delay when enabled.
    ///
    /// The delay is scaled by a uniform factor in `[0.5, 1.5)` and capped at
    /// `max_delay`.
    #[must_use]
    pub fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter {
            return delay;
        }
        let factor = 0.5 + rand::random::<f64>();
        delay.mul_f64(factor).min(self.max_delay)
    }
}

fn invalid(message: &str) -> Error {
    Error::InvalidInput(format!("retry config: {message}"))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed() -> RetryConfig {
        RetryConfig::default()
            .with_delays(Duration::from_millis(100), Duration::from_secs(1))
            .with_jitter(false)
    }

    #[test]
    fn test_config_default_values() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.base_delay, Duration::from_secs(1));
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.half_open_max_calls, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_grows_exponentially_then_caps() {
        let config = fixed();
        assert_eq!(config.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(config.backoff_delay(4), Duration::from_millis(800));
        assert_eq!(config.backoff_delay(5), Duration::from_secs(1));
        assert_eq!(config.backoff_delay(500), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_disabled_is_identity() {
        let config = fixed();
        let delay = Duration::from_millis(300);
        assert_eq!(config.jittered(delay), delay);
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let config = fixed().with_jitter(true);
        let delay = Duration::from_millis(400);
        for _ in 0..200 {
            let jittered = config.jittered(delay);
            assert!(jittered >= Duration::from_millis(200));
            assert!(jittered <= config.max_delay);
        }
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad = [
            fixed().with_max_attempts(0),
            fixed().with_delays(Duration::ZERO, Duration::from_secs(1)),
            fixed().with_delays(Duration::from_secs(2), Duration::from_secs(1)),
            fixed().with_exponential_base(1.0),
            fixed().with_failure_threshold(0),
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(Error::InvalidInput(_))));
        }
    }
}
