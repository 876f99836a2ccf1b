//! Retry with backoff and circuit breaking for unreliable dependencies.
//!
//! Miners drop off Wi-Fi and `SQLite` reports `SQLITE_BUSY` under write
//! contention. Both are wrapped in a [`RetryPolicy`], which retries only
//! errors classified as transient by [`crate::Error::is_retryable`] and
//! reports every outcome to a named circuit in a shared
//! [`CircuitBreakerRegistry`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use hashwatch::resilience::{CircuitBreakerRegistry, RetryConfig, RetryPolicy};
//! use std::sync::Arc;
//!
//! let registry = Arc::new(CircuitBreakerRegistry::new());
//! let policy = RetryPolicy::new(RetryConfig::default(), Arc::clone(&registry));
//! let status = policy
//!     .execute("get_status", Some("miner:bitaxe-1"), || client.get_status())
//!     .await?;
//! ```

mod breaker;
mod config;
mod retry;

pub use breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitState, CircuitStats};
pub use config::RetryConfig;
pub use retry::{RetryPolicy, Retrying};
