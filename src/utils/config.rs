// src/utils/config.rs
//! Layered driver configuration
//!
//! Sources, lowest priority first:
//!
//! 1. Built-in defaults ([`DriverConfig::default`])
//! 2. Optional config file (`driver.{toml,yaml,json}` or `$EVOLVE_CONFIG`)
//! 3. Environment variables, e.g. `EVOLVE_SCHEDULER__UPDATE_INTERVAL=10`

use crate::utils::errors::{DriverError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Grid dimensions the engine supports
pub const SUPPORTED_GRID_DIMENSIONS: [u32; 3] = [32, 64, 128];

/// Population size bounds (inclusive)
pub const POPULATION_RANGE: (usize, usize) = (10, 1000);

/// Mutation rate bounds (inclusive)
pub const MUTATION_RATE_RANGE: (f64, f64) = (0.001, 0.1);

/// Update interval bounds (inclusive)
pub const UPDATE_INTERVAL_RANGE: (u32, u32) = (1, 100);

/// Top-level driver configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DriverConfig {
    pub image: ImageConfig,
    pub evolution: EvolutionConfig,
    pub scheduler: SchedulerConfig,
    pub benchmark: BenchmarkConfig,
    pub pool: PoolConfig,
    pub isolation: IsolationConfig,
    pub observability: ObservabilityConfig,
}

/// Target image source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ImageConfig {
    /// Path of the target image
    pub source: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            source: "target.png".to_string(),
        }
    }
}

/// Parameters handed to the engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EvolutionConfig {
    /// Individuals per engine instance (10-1000)
    pub population_size: usize,

    /// Base mutation rate (0.001-0.1)
    pub mutation_rate: f64,

    /// Let the engine scale the mutation rate by fitness
    pub auto_mutation: bool,

    /// Side length of the square target grid (32, 64 or 128)
    pub grid_dimension: u32,

    /// Let the engine use the worker pool
    pub parallel: bool,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            population_size: 100,
            mutation_rate: 0.01,
            auto_mutation: false,
            grid_dimension: 32,
            parallel: true,
        }
    }
}

/// Loop pacing and batching
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Generations per tick while visual updates are on (1-100)
    pub update_interval: u32,

    /// Materialize the best image on every tick
    pub visual_updates: bool,

    /// Generations per tick while visual updates are off
    pub throughput_batch_size: u32,

    /// Frame rate the loop is paced at
    pub frame_rate_hz: u32,

    /// Accumulated generations between housekeeping passes
    pub housekeeping_interval: u64,

    /// Fitness samples kept for charting
    pub history_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            update_interval: 1,
            visual_updates: true,
            throughput_batch_size: 500,
            frame_rate_hz: 60,
            housekeeping_interval: 500,
            history_capacity: 1000,
        }
    }
}

/// Time-to-threshold benchmark
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BenchmarkConfig {
    pub enabled: bool,

    /// Fitness threshold in percent, exclusive (0, 100)
    pub target_percent: f64,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            target_percent: 90.0,
        }
    }
}

/// Worker pool sizing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on workers regardless of hardware concurrency
    pub max_workers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_workers: 8 }
    }
}

/// Isolation precondition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IsolationConfig {
    /// When false the gate always passes
    pub required: bool,

    /// Treat the host as isolated without consulting the environment
    pub assume_isolated: bool,

    /// Environment flag consulted when `assume_isolated` is false
    pub env_var: String,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            required: true,
            assume_isolated: false,
            env_var: "CROSS_ORIGIN_ISOLATED".to_string(),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_format: LogFormat,
}

impl DriverConfig {
    /// Load configuration from defaults, `$EVOLVE_CONFIG` or `driver.*`, and the environment
    pub fn load() -> Result<Self> {
        match std::env::var("EVOLVE_CONFIG") {
            Ok(path) => Self::load_from(Some(Path::new(&path))),
            Err(_) => Self::load_from(None),
        }
    }

    /// Load configuration, reading `path` (required) instead of the optional `driver.*`
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        builder = match path {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::with_name("driver").required(false)),
        };

        let config: Self = builder
            .add_source(
                Environment::with_prefix("EVOLVE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate every recognized option
    pub fn validate(&self) -> Result<()> {
        validate_population_size(self.evolution.population_size)?;
        validate_mutation_rate(self.evolution.mutation_rate)?;
        validate_grid_dimension(self.evolution.grid_dimension)?;
        validate_update_interval(self.scheduler.update_interval)?;
        validate_target_percent(self.benchmark.target_percent)?;

        if self.scheduler.throughput_batch_size == 0 {
            return Err(DriverError::ConfigError(
                "throughput_batch_size must be at least 1".into(),
            ));
        }
        if self.scheduler.frame_rate_hz == 0 || self.scheduler.frame_rate_hz > 1000 {
            return Err(DriverError::ConfigError(format!(
                "frame_rate_hz must be within 1-1000, got {}",
                self.scheduler.frame_rate_hz
            )));
        }
        if self.scheduler.housekeeping_interval == 0 {
            return Err(DriverError::ConfigError(
                "housekeeping_interval must be at least 1".into(),
            ));
        }
        if self.pool.max_workers == 0 {
            return Err(DriverError::ConfigError("max_workers must be at least 1".into()));
        }

        Ok(())
    }
}

pub fn validate_population_size(size: usize) -> Result<()> {
    let (min, max) = POPULATION_RANGE;
    if size < min || size > max {
        return Err(DriverError::ConfigError(format!(
            "population_size must be within {}-{}, got {}",
            min, max, size
        )));
    }
    Ok(())
}

pub fn validate_mutation_rate(rate: f64) -> Result<()> {
    let (min, max) = MUTATION_RATE_RANGE;
    if !(min..=max).contains(&rate) {
        return Err(DriverError::ConfigError(format!(
            "mutation_rate must be within {}-{}, got {}",
            min, max, rate
        )));
    }
    Ok(())
}

pub fn validate_grid_dimension(dimension: u32) -> Result<()> {
    if !SUPPORTED_GRID_DIMENSIONS.contains(&dimension) {
        return Err(DriverError::ConfigError(format!(
            "grid_dimension must be one of {:?}, got {}",
            SUPPORTED_GRID_DIMENSIONS, dimension
        )));
    }
    Ok(())
}

pub fn validate_update_interval(interval: u32) -> Result<()> {
    let (min, max) = UPDATE_INTERVAL_RANGE;
    if interval < min || interval > max {
        return Err(DriverError::ConfigError(format!(
            "update_interval must be within {}-{}, got {}",
            min, max, interval
        )));
    }
    Ok(())
}

pub fn validate_target_percent(percent: f64) -> Result<()> {
    if !(percent > 0.0 && percent < 100.0) {
        return Err(DriverError::ConfigError(format!(
            "benchmark target must be strictly between 0 and 100 percent, got {}",
            percent
        )));
    }
    Ok(())
}
