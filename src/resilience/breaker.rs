//! Named circuit breakers.
//!
//! # Circuit Breaker States
//!
//! ```text
//! +--------+     failures >= threshold     +------+
//! | Closed | --------------------------->  | Open |
//! +--------+                               +------+
//!     ^                                        |
//!     |  success                               | recovery timeout elapsed
//!     |                                        v
//!     +--------------------------------  +-----------+
//!                                        | Half-Open |
//!                                        +-----------+
//! ```
//!
//! A failure while half-open reopens the circuit. Circuits live in a
//! [`CircuitBreakerRegistry`] that callers own and share by `Arc`; there is no
//! process-global registry.

use super::RetryConfig;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls are rejected.
    Open,
    /// A limited number of trial calls pass through.
    HalfOpen,
}

impl CircuitState {
    /// Returns the state as a string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    /// Numeric value for gauges (0 closed, 1 open, 2 half-open).
    #[must_use]
    pub const fn gauge_value(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one circuit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitStats {
    /// Circuit name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures recorded.
    pub failure_count: u32,
    /// Wall-clock time of the most recent failure.
    pub last_failure_time: Option<DateTime<Utc>>,
    /// Successful trial calls since the circuit last went half-open.
    pub success_count_in_half_open: u32,
}

#[derive(Debug)]
enum BreakerState {
    Closed,
    Open { opened_at: Instant },
    HalfOpen { attempts: u32 },
}

/// Circuit breaker for a single named dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    state: BreakerState,
    failure_count: u32,
    last_failure_time: Option<DateTime<Utc>>,
    success_count_in_half_open: u32,
    failure_threshold: u32,
    recovery_timeout: Duration,
    half_open_max_calls: u32,
}

impl CircuitBreaker {
    /// Creates a closed breaker with thresholds from `config`.
    #[must_use]
    pub fn new(name: impl Into<String>, config: &RetryConfig) -> Self {
        Self {
            name: name.into(),
            state: BreakerState::Closed,
            failure_count: 0,
            last_failure_time: None,
            success_count_in_half_open: 0,
            failure_threshold: config.failure_threshold.max(1),
            recovery_timeout: config.recovery_timeout,
            half_open_max_calls: config.half_open_max_calls.max(1),
        }
    }

    /// Checks if a call is allowed through the breaker.
    ///
    /// An open breaker whose recovery timeout has elapsed moves to half-open
    /// and admits the call as a trial.
    pub fn allow(&mut self) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open { opened_at } => {
                if opened_at.elapsed() >= self.recovery_timeout {
                    tracing::info!(
                        circuit = %self.name,
                        "Circuit breaker transitioning to half-open"
                    );
                    self.state = BreakerState::HalfOpen { attempts: 1 };
                    self.success_count_in_half_open = 0;
                    true
                } else {
                    false
                }
            },
            BreakerState::HalfOpen { ref mut attempts } => {
                if *attempts >= self.half_open_max_calls {
                    false
                } else {
                    *attempts += 1;
                    true
                }
            },
        }
    }

    /// Records a successful call.
    ///
    /// Only a half-open trial closes the circuit. A success reported while
    /// open belongs to a call admitted before the trip and is ignored.
    pub fn on_success(&mut self) {
        match self.state {
            BreakerState::Closed => self.failure_count = 0,
            BreakerState::HalfOpen { .. } => {
                self.success_count_in_half_open += 1;
                tracing::info!(circuit = %self.name, "Circuit breaker closing after trial success");
                self.state = BreakerState::Closed;
                self.failure_count = 0;
            },
            BreakerState::Open { .. } => {
                tracing::debug!(circuit = %self.name, "Ignoring late success while open");
            },
        }
    }

    /// Records a failed call.
    ///
    /// Returns `true` if the circuit just opened.
    pub fn on_failure(&mut self) -> bool {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_time = Some(Utc::now());
        match self.state {
            BreakerState::Closed => {
                if self.failure_count >= self.failure_threshold {
                    tracing::warn!(
                        circuit = %self.name,
                        failures = self.failure_count,
                        threshold = self.failure_threshold,
                        "Circuit breaker opened after consecutive failures"
                    );
                    self.state = BreakerState::Open {
                        opened_at: Instant::now(),
                    };
                    return true;
                }
            },
            BreakerState::HalfOpen { .. } => {
                tracing::warn!(circuit = %self.name, "Circuit breaker re-opened after half-open failure");
                self.state = BreakerState::Open {
                    opened_at: Instant::now(),
                };
                return true;
            },
            // Late failures push the recovery deadline out
            BreakerState::Open { .. } => {
                self.state = BreakerState::Open {
                    opened_at: Instant::now(),
                };
            },
        }
        false
    }

    /// Gives back a half-open trial slot whose call ended without a verdict.
    ///
    /// Used when the trial was cancelled or failed with a non-retryable error.
    pub const fn release_trial(&mut self) {
        if let BreakerState::HalfOpen { ref mut attempts } = self.state {
            *attempts = attempts.saturating_sub(1);
        }
    }

    /// Forces the circuit closed and clears its counters.
    pub fn reset(&mut self) {
        self.state = BreakerState::Closed;
        self.failure_count = 0;
        self.success_count_in_half_open = 0;
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> CircuitState {
        match self.state {
            BreakerState::Closed => CircuitState::Closed,
            BreakerState::Open { .. } => CircuitState::Open,
            BreakerState::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// Consecutive failures recorded.
    #[must_use]
    pub const fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Returns a snapshot of this breaker.
    #[must_use]
    pub fn stats(&self) -> CircuitStats {
        CircuitStats {
            name: self.name.clone(),
            state: self.state(),
            failure_count: self.failure_count,
            last_failure_time: self.last_failure_time,
            success_count_in_half_open: self.success_count_in_half_open,
        }
    }
}

/// Registry of circuit breakers keyed by name.
///
/// A circuit is created the first time its name is used, with thresholds
/// from the caller's [`RetryConfig`]. All updates go through one mutex that
/// is never held across an await point.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    circuits: Mutex<HashMap<String, CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CircuitBreaker>> {
        self.circuits
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Asks the named circuit to admit a call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CircuitOpen`] if the circuit rejects the call.
    pub fn try_acquire(&self, name: &str, config: &RetryConfig) -> Result<()> {
        let mut circuits = self.lock();
        let breaker = circuits
            .entry(name.to_string())
            .or_insert_with(|| CircuitBreaker::new(name, config));
        let allowed = breaker.allow();
        let state = breaker.state();
        drop(circuits);
        record_state(name, state);

        if allowed {
            Ok(())
        } else {
            metrics::counter!("circuit_breaker_rejections_total", "circuit" => name.to_string())
                .increment(1);
            Err(Error::CircuitOpen {
                circuit: name.to_string(),
            })
        }
    }

    /// Records a success on the named circuit.
    pub fn record_success(&self, name: &str) {
        let state = self.with_circuit(name, |breaker| {
            breaker.on_success();
            breaker.state()
        });
        if let Some(state) = state {
            record_state(name, state);
        }
    }

    /// Records a failure on the named circuit.
    ///
    /// Returns `true` if the circuit just opened.
    pub fn record_failure(&self, name: &str) -> bool {
        let outcome = self.with_circuit(name, |breaker| (breaker.on_failure(), breaker.state()));
        let Some((tripped, state)) = outcome else {
            return false;
        };
        record_state(name, state);
        if tripped {
            metrics::counter!("circuit_breaker_trips_total", "circuit" => name.to_string())
                .increment(1);
        }
        tripped
    }

    /// Frees a half-open trial slot without recording an outcome.
    pub fn release_trial(&self, name: &str) {
        self.with_circuit(name, CircuitBreaker::release_trial);
    }

    /// Forces the named circuit closed with a zero failure count.
    ///
    /// Returns `false` if no such circuit exists.
    pub fn reset_circuit(&self, name: &str) -> bool {
        let reset = self.with_circuit(name, CircuitBreaker::reset).is_some();
        if reset {
            tracing::info!(circuit = name, "Circuit breaker reset");
            record_state(name, CircuitState::Closed);
        }
        reset
    }

    /// Returns the state of the named circuit, if it exists.
    #[must_use]
    pub fn state(&self, name: &str) -> Option<CircuitState> {
        self.lock().get(name).map(CircuitBreaker::state)
    }

    /// Returns a snapshot of every circuit, sorted by name.
    #[must_use]
    pub fn get_stats(&self) -> Vec<CircuitStats> {
        let mut stats: Vec<CircuitStats> = self.lock().values().map(CircuitBreaker::stats).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    fn with_circuit<R>(&self, name: &str, f: impl FnOnce(&mut CircuitBreaker) -> R) -> Option<R> {
        self.lock().get_mut(name).map(f)
    }
}

fn record_state(name: &str, state: CircuitState) {
    metrics::gauge!("circuit_breaker_state", "circuit" => name.to_string())
        .set(f64::from(state.gauge_value()));
}
