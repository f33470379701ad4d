// src/observability/mod.rs
//! Logging and metrics setup
//!
//! Tracing goes through `tracing-subscriber` with an `EnvFilter`
//! (`RUST_LOG`, default `info`). Metrics are recorded with the `metrics`
//! facade and rendered by the Prometheus exporter.

use crate::utils::config::LogFormat;
use crate::utils::errors::{DriverError, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Total generations advanced across all engine instances
pub const GENERATIONS_TOTAL: &str = "driver_generations_total";

/// Best fitness of the current engine (0-1)
pub const BEST_FITNESS: &str = "driver_best_fitness";

/// Last published throughput
pub const GENERATIONS_PER_SECOND: &str = "driver_generations_per_second";

/// Engine instances created after the first
pub const ENGINE_RECREATIONS_TOTAL: &str = "driver_engine_recreations_total";

/// Wall time of one scheduler tick
pub const TICK_DURATION_SECONDS: &str = "driver_tick_duration_seconds";

/// Install the global tracing subscriber
pub fn init_tracing(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json().with_current_span(false)).try_init(),
    };

    installed.map_err(|e| DriverError::ConfigError(format!("Failed to install tracing subscriber: {}", e)))
}

/// Install the Prometheus recorder and describe the driver's metrics
pub fn init_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| DriverError::ConfigError(format!("Failed to install metrics recorder: {}", e)))?;

    metrics::describe_counter!(GENERATIONS_TOTAL, "Generations advanced by the scheduler");
    metrics::describe_gauge!(BEST_FITNESS, "Best fitness reported by the engine");
    metrics::describe_gauge!(GENERATIONS_PER_SECOND, "Generations per second over the last window");
    metrics::describe_counter!(ENGINE_RECREATIONS_TOTAL, "Engine instances replaced by reset or parameter change");
    metrics::describe_histogram!(TICK_DURATION_SECONDS, "Wall time of one scheduler tick");

    Ok(handle)
}
