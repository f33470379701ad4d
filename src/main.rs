// src/main.rs
//! Pixel Evolution Driver
//!
//! Headless runner: evolves the configured target image with the island
//! engine until the benchmark threshold is reached or Ctrl-C arrives, then
//! prints the final snapshot as JSON.

use anyhow::{Context, Result};
use pixel_evolution_driver::observability::{init_metrics, init_tracing};
use pixel_evolution_driver::reference::IslandEngineFactory;
use pixel_evolution_driver::runtime::isolation::IsolationGate;
use pixel_evolution_driver::runtime::parallel_pool::{ParallelismGate, RayonPoolBackend};
use pixel_evolution_driver::{Driver, DriverConfig, DriverDeps, FileImageSource};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first; it selects the log format
    let config = DriverConfig::load().context("loading configuration")?;

    init_tracing(config.observability.log_format)?;
    let metrics = init_metrics()?;

    info!("Starting pixel evolution driver v{}", pixel_evolution_driver::VERSION);
    info!("Configuration loaded: {:?}", config);

    let max_workers = config.pool.max_workers;
    let deps = DriverDeps {
        engine_factory: Arc::new(IslandEngineFactory),
        image_source: Arc::new(FileImageSource::new()),
        pool: ParallelismGate::global_or_init(|| ParallelismGate::new(Arc::new(RayonPoolBackend), max_workers)),
        isolation: IsolationGate::from_config(&config.isolation),
    };

    let driver = Driver::new(&config, deps)?;
    driver.setup().await.context("driver setup")?;
    driver.play().await?;

    let mut snapshots = driver.subscribe();
    let finished = snapshots.wait_for(|s| !s.is_playing);

    // Run until the run stops on its own or we are interrupted
    tokio::select! {
        result = finished => {
            if result.is_err() {
                warn!("Snapshot channel closed");
            }
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("installing Ctrl-C handler")?;
            info!("Received shutdown signal, stopping...");
        }
    }

    driver.pause().await;
    let snapshot = driver.snapshot();
    driver.shutdown().await;

    match &snapshot.benchmark {
        Some(result) => info!(
            "Reached {:.1}% at generation {} in {:.3}s",
            result.target_fitness * 100.0,
            result.generation,
            result.elapsed_seconds
        ),
        None => info!("Stopped at generation {} (fitness {:.4})", snapshot.generation, snapshot.fitness),
    }
    if let Some(error) = &snapshot.last_error {
        warn!("Last error: {}", error);
    }

    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    info!("Metrics:\n{}", metrics.render());

    Ok(())
}
