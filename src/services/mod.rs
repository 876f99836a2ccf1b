//! Business logic services.
//!
//! Services orchestrate miner clients and the store.
//!
//! - `poller.rs`: fetch-and-persist for one miner, retention sweeps
//! - `maintenance.rs`: background upkeep for long-running processes

mod maintenance;
mod poller;

pub use maintenance::MaintenanceTasks;
pub use poller::{MetricsPoller, PollReport};
