//! Shared `SQLite` infrastructure for the pool and the time-series store.
//!
//! ## Module Structure
//!
//! - [`connection`]: opening, pragma configuration, liveness ping and
//!   result-code based error classification
//! - [`metrics`]: shared metrics recording helpers
//! - [`transaction`]: `BEGIN IMMEDIATE` write transactions

mod connection;
mod metrics;
mod transaction;

pub use connection::{
    BUSY_TIMEOUT_MS, acquire_lock, classify, configure_connection, connection_error, open_file,
    open_shared_memory, ping, storage_error,
};
pub use metrics::{record_operation_metrics, status_label};
pub use transaction::with_immediate_transaction;
