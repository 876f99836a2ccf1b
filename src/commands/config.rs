//! Config command handler.
//!
//! Prints the effective configuration after file and environment layers.

use hashwatch::config::MonitorConfig;
use hashwatch::observability::{LoggingConfig, MetricsConfig};
use std::time::Duration;

/// Config command.
pub fn cmd_config(config: &MonitorConfig) -> Result<(), Box<dyn std::error::Error>> {
    println!("Current Configuration");
    println!("=====================");
    println!();

    println!("Database:");
    match config.database_path() {
        Ok(path) => println!("  Path: {}", path.display()),
        Err(e) => println!("  Path: (unresolved: {e})"),
    }
    println!("  Max Connections: {}", config.database.max_connections);
    println!(
        "  Health Check Interval: {}",
        secs(config.database.health_check_interval)
    );
    println!(
        "  Acquire Timeout: {}",
        config
            .database
            .acquire_timeout
            .map_or_else(|| "(none)".to_string(), millis)
    );
    println!();

    println!("Cache:");
    println!("  TTL: {}", secs(config.cache.default_ttl));
    println!("  Max Entries: {}", config.cache.max_entries);
    println!();

    let retry = &config.retry;
    println!("Retry:");
    println!("  Max Attempts: {}", retry.max_attempts);
    println!("  Base Delay: {}", millis(retry.base_delay));
    println!("  Max Delay: {}", millis(retry.max_delay));
    println!("  Exponential Base: {}", retry.exponential_base);
    println!("  Jitter: {}", retry.jitter);
    println!("  Failure Threshold: {}", retry.failure_threshold);
    println!("  Recovery Timeout: {}", millis(retry.recovery_timeout));
    println!();

    println!("Retention:");
    println!("  Days: {}", config.retention.days);
    println!("  Sweep Interval: {}", secs(config.retention.sweep_interval));
    println!();

    let logging = LoggingConfig::from_settings(config.observability.logging.as_ref(), false);
    let metrics = MetricsConfig::from_settings(config.observability.metrics.as_ref());
    println!("Observability:");
    println!("  Log Filter: {}", logging.filter);
    println!("  Log Format: {:?}", logging.format);
    println!(
        "  Log File: {}",
        logging
            .file
            .as_ref()
            .map_or_else(|| "(stderr)".to_string(), |p| p.display().to_string())
    );
    println!("  Metrics Enabled: {}", metrics.enabled);
    println!("  Metrics Listen: {}", metrics.listen_addr);
    println!();

    println!("Miners:");
    if config.miners.is_empty() {
        println!("  (none)");
    }
    for miner in &config.miners {
        println!(
            "  - {} ({})",
            miner.id,
            miner.host.as_deref().unwrap_or("no host")
        );
    }

    Ok(())
}

fn secs(d: Duration) -> String {
    format!("{}s", d.as_secs())
}

fn millis(d: Duration) -> String {
    format!("{}ms", d.as_millis())
}
