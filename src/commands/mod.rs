//! Command handlers module.
//!
//! - `store.rs`: commands that open the time-series store
//! - `config.rs`: configuration display
//! - `watch.rs`: long-running maintenance loop

mod config;
mod store;
mod watch;

use clap::Subcommand;

pub use config::cmd_config;
pub use watch::cmd_watch;
pub use store::{
    cmd_aggregate, cmd_cleanup, cmd_ingest, cmd_init, cmd_latest, cmd_miners, cmd_raw,
};

/// Miner registry subcommands.
#[derive(Subcommand)]
pub enum MinerAction {
    /// List registered miners.
    List,

    /// Register a miner or update its details.
    Add {
        /// Stable miner id.
        id: String,

        /// Display name; defaults to the id.
        #[arg(short, long)]
        name: Option<String>,

        /// Hardware model.
        #[arg(short, long)]
        model: Option<String>,

        /// Host or IP address.
        #[arg(long)]
        host: Option<String>,
    },

    /// Delete a miner and all of its samples.
    Remove {
        /// Miner id.
        id: String,
    },
}
