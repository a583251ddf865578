//! Observability module for statesync.
//!
//! Provides logging initialization and the metrics recorded by publication,
//! persistence and dangling-index reconciliation. Metrics go through the
//! `metrics` facade; installing a recorder is left to the embedding process.

use crate::config::ObservabilityConfig;
use crate::error::{Result, SyncError};
use ::tracing::info;
use metrics::{counter, gauge};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging.
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| SyncError::Internal(format!("Failed to init logging: {}", e)))?;
    } else {
        subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| SyncError::Internal(format!("Failed to init logging: {}", e)))?;
    }

    info!("Observability initialized");
    Ok(())
}

/// Register statesync metrics with zero values.
pub fn register_metrics() {
    counter!("statesync_publish_rounds_total").absolute(0);
    counter!("statesync_publish_timeouts_total").absolute(0);
    gauge!("statesync_dangling_indices").set(0.0);
    gauge!("statesync_applied_state_version").set(0.0);
}

/// Record the start of a publication round.
pub fn record_publish_round() {
    counter!("statesync_publish_rounds_total").increment(1);
}

/// Record one peer's answer to a publication.
pub fn record_publish_ack(success: bool) {
    let result = if success { "ack" } else { "failure" };
    counter!("statesync_publish_acks_total", "result" => result).increment(1);
}

/// Record a publication wait that gave up before every peer answered.
pub fn record_publish_timeout() {
    counter!("statesync_publish_timeouts_total").increment(1);
}

/// Record a state document write; `kind` is `global` or `index`.
pub fn record_gateway_write(kind: &'static str, success: bool) {
    let result = if success { "ok" } else { "error" };
    counter!("statesync_gateway_writes_total", "kind" => kind, "result" => result).increment(1);
}

pub fn update_dangling_indices(count: usize) {
    gauge!("statesync_dangling_indices").set(count as f64);
}

pub fn update_applied_state_version(version: u64) {
    gauge!("statesync_applied_state_version").set(version as f64);
}
