//! Retry executor with exponential backoff and circuit breaking.

use super::{CircuitBreakerRegistry, RetryConfig};
use crate::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::Instrument;

/// Runs fallible async operations with retries and optional circuit breaking.
///
/// Only errors whose [`Error::is_retryable`] is `true` are retried and counted
/// against a circuit. Everything else is returned on first occurrence.
///
/// Dropping the future returned by [`execute`](Self::execute) stops the retry
/// loop; no attempt is scheduled in the background.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    registry: Arc<CircuitBreakerRegistry>,
}

impl RetryPolicy {
    /// Creates a policy sharing the given breaker registry.
    #[must_use]
    pub const fn new(config: RetryConfig, registry: Arc<CircuitBreakerRegistry>) -> Self {
        Self { config, registry }
    }

    /// Creates a policy with a private breaker registry.
    #[must_use]
    pub fn standalone(config: RetryConfig) -> Self {
        Self::new(config, Arc::new(CircuitBreakerRegistry::new()))
    }

    /// Returns the retry configuration.
    #[must_use]
    pub const fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Returns the breaker registry this policy reports to.
    #[must_use]
    pub const fn registry(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.registry
    }

    /// Executes `call`, retrying retryable failures.
    ///
    /// When `circuit` is given, each attempt must be admitted by that circuit
    /// and its outcome is recorded there. If the circuit opens while retrying,
    /// the remaining attempts are abandoned.
    ///
    /// # Errors
    ///
    /// - [`Error::CircuitOpen`] if the circuit rejects the first attempt
    /// - the first non-retryable error returned by `call`
    /// - the last retryable error once attempts are exhausted
    pub async fn execute<T, F, Fut>(
        &self,
        operation: &str,
        circuit: Option<&str>,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let span = tracing::debug_span!(
            "retry.execute",
            operation = operation,
            circuit = circuit.unwrap_or("-"),
            attempts = tracing::field::Empty,
        );

        async {
            let max_attempts = self.config.max_attempts.max(1);
            let mut attempt = 0u32;
            let mut last_error: Option<Error> = None;

            loop {
                attempt += 1;
                tracing::Span::current().record("attempts", attempt);

                let guard = match circuit {
                    Some(name) => match self.registry.try_acquire(name, &self.config) {
                        Ok(()) => Some(TrialGuard::new(&self.registry, name)),
                        Err(rejected) => return Err(last_error.unwrap_or(rejected)),
                    },
                    None => None,
                };

                let started = Instant::now();
                let result = self.run_attempt(operation, &mut call).await;
                let elapsed = started.elapsed();

                let err = match result {
                    Ok(value) => {
                        if let Some(guard) = guard {
                            guard.success();
                        }
                        record_attempt(operation, "success", elapsed);
                        return Ok(value);
                    },
                    Err(err) => err,
                };

                if !err.is_retryable() {
                    record_attempt(operation, "fatal", elapsed);
                    tracing::debug!(error = %err, "Non-retryable failure");
                    return Err(err);
                }

                record_attempt(operation, err.kind(), elapsed);
                let tripped = guard.is_some_and(TrialGuard::failure);
                if tripped || attempt >= max_attempts {
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        tripped,
                        error = %err,
                        "Giving up on operation"
                    );
                    return Err(err);
                }

                let delay = self.config.jittered(self.config.backoff_delay(attempt));
                tracing::warn!(
                    attempt,
                    max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Retrying after transient failure"
                );
                metrics::counter!("retries_total", "operation" => operation.to_string())
                    .increment(1);
                last_error = Some(err);
                tokio::time::sleep(delay).await;
            }
        }
        .instrument(span)
        .await
    }

    async fn run_attempt<T, F, Fut>(&self, operation: &str, call: &mut F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let Some(limit) = self.config.attempt_timeout else {
            return call().await;
        };
        tokio::time::timeout(limit, call())
            .await
            .unwrap_or_else(|_| {
                Err(Error::Timeout {
                    operation: operation.to_string(),
                    elapsed_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                })
            })
    }

    /// Wraps `op` so every call runs through this policy.
    #[must_use]
    pub fn wrap<F>(
        self: &Arc<Self>,
        operation: impl Into<String>,
        circuit: Option<String>,
        op: F,
    ) -> Retrying<F> {
        Retrying {
            policy: Arc::clone(self),
            operation: operation.into(),
            circuit,
            op,
        }
    }
}

/// An operation bound to a [`RetryPolicy`].
///
/// Built by [`RetryPolicy::wrap`]; each [`call`](Self::call) is an
/// independent retry loop.
pub struct Retrying<F> {
    policy: Arc<RetryPolicy>,
    operation: String,
    circuit: Option<String>,
    op: F,
}

impl<F> Retrying<F> {
    /// Invokes the wrapped operation with retries.
    ///
    /// # Errors
    ///
    /// Same as [`RetryPolicy::execute`].
    pub async fn call<T, Fut>(&self) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.policy
            .execute(&self.operation, self.circuit.as_deref(), || (self.op)())
            .await
    }
}

/// Settles the outcome of one admitted call on its circuit.
///
/// Dropped unsettled (cancellation, non-retryable error) it hands a half-open
/// trial slot back.
struct TrialGuard<'a> {
    registry: &'a CircuitBreakerRegistry,
    name: &'a str,
    settled: bool,
}

impl<'a> TrialGuard<'a> {
    const fn new(registry: &'a CircuitBreakerRegistry, name: &'a str) -> Self {
        Self {
            registry,
            name,
            settled: false,
        }
    }

    fn success(mut self) {
        self.settled = true;
        self.registry.record_success(self.name);
    }

    fn failure(mut self) -> bool {
        self.settled = true;
        self.registry.record_failure(self.name)
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.registry.release_trial(self.name);
        }
    }
}

fn record_attempt(operation: &str, status: &'static str, elapsed: std::time::Duration) {
    metrics::counter!(
        "retry_attempts_total",
        "operation" => operation.to_string(),
        "status" => status
    )
    .increment(1);
    metrics::histogram!(
        "retry_attempt_duration_ms",
        "operation" => operation.to_string()
    )
    .record(elapsed.as_secs_f64() * 1000.0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitState;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn connection_error() -> Error {
        Error::Connection {
            operation: "read_status".to_string(),
            cause: "connection refused".to_string(),
        }
    }

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig::default()
            .with_max_attempts(max_attempts)
            .with_delays(Duration::from_millis(100), Duration::from_secs(1))
            .with_jitter(false)
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_operation_invoked_max_attempts_times() {
        for n in 1..=5 {
            let policy = RetryPolicy::standalone(fast_config(n));
            let calls = AtomicU32::new(0);

            let result: Result<()> = policy
                .execute("read_status", None, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(connection_error()) }
                })
                .await;

            assert!(matches!(result, Err(Error::Connection { .. })));
            assert_eq!(calls.load(Ordering::SeqCst), n);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delays_without_jitter() {
        let policy = RetryPolicy::standalone(fast_config(5));
        let stamps = Mutex::new(Vec::new());

        let _: Result<()> = policy
            .execute("read_status", None, || {
                stamps
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .push(Instant::now());
                async { Err(connection_error()) }
            })
            .await;

        let stamps = stamps.into_inner().unwrap();
        assert_eq!(stamps.len(), 5);
        let gaps: Vec<u128> = stamps
            .windows(2)
            .map(|w| (w[1] - w[0]).as_millis())
            .collect();
        // attempt k waits min(max, base * 2^(k-2))
        let expected = [100u128, 200, 400, 800];
        for (gap, want) in gaps.iter().zip(expected) {
            assert!(gap.abs_diff(want) <= 5, "gap {gap}ms, expected {want}ms");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_propagates_immediately() {
        let policy = RetryPolicy::standalone(fast_config(5).with_failure_threshold(1));
        let calls = AtomicU32::new(0);

        let result: Result<()> = policy
            .execute("validate", Some("db"), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::InvalidInput("bad timestamp".to_string())) }
            })
            .await;

        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = policy.registry().get_stats();
        assert_eq!(stats[0].failure_count, 0);
        assert_eq!(stats[0].state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let policy = RetryPolicy::standalone(fast_config(4));
        let calls = AtomicU32::new(0);

        let result = policy
            .execute("read_status", Some("miner"), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(connection_error())
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(policy.registry().get_stats()[0].failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_after_threshold_and_blocks_calls() {
        let policy = RetryPolicy::standalone(
            fast_config(1)
                .with_failure_threshold(3)
                .with_recovery_timeout(Duration::from_secs(30)),
        );
        let calls = AtomicU32::new(0);
        let op = || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(connection_error()) }
        };

        for _ in 0..2 {
            let _ = policy.execute("read_status", Some("miner:a"), op).await;
            assert_eq!(policy.registry().state("miner:a"), Some(CircuitState::Closed));
        }
        let _ = policy.execute("read_status", Some("miner:a"), op).await;
        assert_eq!(policy.registry().state("miner:a"), Some(CircuitState::Open));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let result = policy.execute("read_status", Some("miner:a"), op).await;
        assert!(matches!(result, Err(Error::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_success_closes_circuit() {
        let policy = RetryPolicy::standalone(
            fast_config(1)
                .with_failure_threshold(1)
                .with_recovery_timeout(Duration::from_secs(10)),
        );
        let _: Result<()> = policy
            .execute("read_status", Some("db"), || async { Err(connection_error()) })
            .await;
        assert_eq!(policy.registry().state("db"), Some(CircuitState::Open));

        tokio::time::advance(Duration::from_secs(10)).await;
        let result = policy.execute("read_status", Some("db"), || async { Ok(1) }).await;
        assert_eq!(result.unwrap(), 1);

        let stats = &policy.registry().get_stats()[0];
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_failure_reopens_circuit() {
        let policy = RetryPolicy::standalone(
            fast_config(1)
                .with_failure_threshold(1)
                .with_recovery_timeout(Duration::from_secs(10)),
        );
        let fail = || async { Err::<(), _>(connection_error()) };
        let _ = policy.execute("read_status", Some("db"), fail).await;

        tokio::time::advance(Duration::from_secs(10)).await;
        let result = policy.execute("read_status", Some("db"), fail).await;
        assert!(matches!(result, Err(Error::Connection { .. })));
        assert_eq!(policy.registry().state("db"), Some(CircuitState::Open));

        let result = policy.execute("read_status", Some("db"), fail).await;
        assert!(matches!(result, Err(Error::CircuitOpen { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_success_does_not_close_tripped_circuit() {
        let policy = Arc::new(RetryPolicy::standalone(
            fast_config(1)
                .with_failure_threshold(1)
                .with_recovery_timeout(Duration::from_secs(60)),
        ));

        let slow_policy = Arc::clone(&policy);
        let slow = tokio::spawn(async move {
            slow_policy
                .execute("slow", Some("db"), || async {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Ok(7)
                })
                .await
        });
        tokio::task::yield_now().await;

        let fast: Result<()> = policy
            .execute("fast", Some("db"), || async { Err(connection_error()) })
            .await;
        assert!(matches!(fast, Err(Error::Connection { .. })));
        assert_eq!(policy.registry().state("db"), Some(CircuitState::Open));

        assert_eq!(slow.await.unwrap().unwrap(), 7);
        assert_eq!(policy.registry().state("db"), Some(CircuitState::Open));
        let rejected = policy.execute("next", Some("db"), || async { Ok(()) }).await;
        assert!(matches!(rejected, Err(Error::CircuitOpen { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tripping_mid_loop_abandons_remaining_attempts() {
        let policy = RetryPolicy::standalone(fast_config(5).with_failure_threshold(2));
        let calls = AtomicU32::new(0);

        let result: Result<()> = policy
            .execute("read_status", Some("db"), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(connection_error()) }
            })
            .await;

        // The last retryable error is preserved, not replaced by CircuitOpen
        assert!(matches!(result, Err(Error::Connection { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_retryable() {
        let policy = RetryPolicy::standalone(
            fast_config(2).with_attempt_timeout(Some(Duration::from_millis(50))),
        );
        let calls = AtomicU32::new(0);

        let result: Result<()> = policy
            .execute("slow", None, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(())
                }
            })
            .await;

        assert!(matches!(
            result,
            Err(Error::Timeout { ref operation, elapsed_ms: 50 }) if operation == "slow"
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_retry_loop_stops() {
        let policy = RetryPolicy::standalone(
            fast_config(10).with_delays(Duration::from_secs(1), Duration::from_secs(1)),
        );
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        let outcome = tokio::time::timeout(
            Duration::from_millis(2_500),
            policy.execute("read_status", Some("db"), move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(connection_error()) }
            }),
        )
        .await;
        assert!(outcome.is_err());
        let seen = calls.load(Ordering::SeqCst);
        assert_eq!(seen, 3);

        tokio::time::advance(Duration::from_secs(60)).await;
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrapped_operation() {
        let policy = Arc::new(RetryPolicy::standalone(fast_config(3)));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let wrapped = policy.wrap("fetch", Some("miner:x".to_string()), move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(connection_error())
                } else {
                    Ok("ok")
                }
            }
        });

        assert_eq!(wrapped.call().await.unwrap(), "ok");
        assert_eq!(wrapped.call().await.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            policy.registry().state("miner:x"),
            Some(CircuitState::Closed)
        );
    }
}
