// src/runtime/benchmark.rs
//! Time-to-threshold benchmark
//!
//! When enabled, every tick compares the engine's best fitness against a
//! target. The first tick at or above the target records the elapsed time
//! and generation, and tells the scheduler to stop. The result is write-once
//! until the benchmark is cleared by reset or by switching the mode off.

use crate::utils::config::{validate_target_percent, BenchmarkConfig};
use crate::utils::errors::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::info;

/// Recorded threshold crossing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResult {
    /// Seconds from the start of the play session to the crossing tick
    pub elapsed_seconds: f64,

    /// Engine generation read back at the crossing tick
    pub generation: u64,

    /// Fitness observed at the crossing tick
    pub fitness: f64,

    /// Threshold in effect (0-1)
    pub target_fitness: f64,

    pub recorded_at: DateTime<Utc>,
}

/// Outcome of observing one tick
#[derive(Debug, Clone, PartialEq)]
pub enum BenchmarkOutcome {
    /// Benchmark off, or already recorded
    Inactive,

    /// Below target
    Pending,

    /// First crossing; the scheduler must stop and force an image read
    Crossed(BenchmarkResult),
}

/// Benchmark mode state
#[derive(Debug, Clone)]
pub struct BenchmarkController {
    enabled: bool,
    target_fitness: f64,
    started_at: Option<Instant>,
    result: Option<BenchmarkResult>,
}

impl BenchmarkController {
    pub fn new(enabled: bool, target_percent: f64) -> Result<Self> {
        validate_target_percent(target_percent)?;
        Ok(Self {
            enabled,
            target_fitness: target_percent / 100.0,
            started_at: None,
            result: None,
        })
    }

    pub fn from_config(config: &BenchmarkConfig) -> Result<Self> {
        Self::new(config.enabled, config.target_percent)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn target_fitness(&self) -> f64 {
        self.target_fitness
    }

    pub fn result(&self) -> Option<&BenchmarkResult> {
        self.result.as_ref()
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    /// Turn the mode on or off; turning it off clears result and timer
    pub fn set_enabled(&mut self, enabled: bool) {
        if !enabled {
            self.clear();
        }
        self.enabled = enabled;
    }

    /// Change the threshold; an already recorded result is kept
    pub fn set_target_percent(&mut self, target_percent: f64) -> Result<()> {
        validate_target_percent(target_percent)?;
        self.target_fitness = target_percent / 100.0;
        Ok(())
    }

    /// Record the play-session start
    pub fn begin(&mut self, now: Instant) {
        if self.enabled {
            self.started_at = Some(now);
        }
    }

    /// Forget the result and the start timestamp
    pub fn clear(&mut self) {
        self.started_at = None;
        self.result = None;
    }

    /// Compare one tick's fitness against the target
    pub fn observe(&mut self, fitness: f64, generation: u64, now: Instant) -> BenchmarkOutcome {
        if !self.enabled || self.result.is_some() {
            return BenchmarkOutcome::Inactive;
        }

        // enabled mid-session: the clock starts at the first observed tick
        let started_at = *self.started_at.get_or_insert(now);

        if fitness < self.target_fitness {
            return BenchmarkOutcome::Pending;
        }

        let result = BenchmarkResult {
            elapsed_seconds: now.saturating_duration_since(started_at).as_secs_f64(),
            generation,
            fitness,
            target_fitness: self.target_fitness,
            recorded_at: Utc::now(),
        };
        info!(
            "Benchmark target {:.1}% reached at generation {} after {:.3}s",
            self.target_fitness * 100.0,
            generation,
            result.elapsed_seconds
        );

        self.result = Some(result.clone());
        BenchmarkOutcome::Crossed(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::errors::DriverError;
    use std::time::Duration;

    #[test]
    fn test_records_first_crossing_only() {
        let start = Instant::now();
        let mut bench = BenchmarkController::new(true, 90.0).unwrap();
        bench.begin(start);

        assert_eq!(bench.observe(0.5, 100, start + Duration::from_secs(1)), BenchmarkOutcome::Pending);

        let crossed = bench.observe(0.91, 452, start + Duration::from_millis(2500));
        match crossed {
            BenchmarkOutcome::Crossed(result) => {
                assert_eq!(result.generation, 452);
                assert!((result.elapsed_seconds - 2.5).abs() < 1e-9);
                assert_eq!(result.fitness, 0.91);
            }
            other => panic!("expected crossing, got {:?}", other),
        }

        // later ticks never overwrite
        assert_eq!(bench.observe(0.99, 900, start + Duration::from_secs(9)), BenchmarkOutcome::Inactive);
        assert_eq!(bench.result().unwrap().generation, 452);
    }

    #[test]
    fn test_exact_target_counts_as_crossing() {
        let start = Instant::now();
        let mut bench = BenchmarkController::new(true, 50.0).unwrap();
        bench.begin(start);
        assert!(matches!(bench.observe(0.5, 10, start), BenchmarkOutcome::Crossed(_)));
    }

    #[test]
    fn test_disabled_is_inactive() {
        let start = Instant::now();
        let mut bench = BenchmarkController::new(false, 90.0).unwrap();
        bench.begin(start);
        assert!(bench.started_at().is_none());
        assert_eq!(bench.observe(1.0, 10, start), BenchmarkOutcome::Inactive);
        assert!(bench.result().is_none());
    }

    #[test]
    fn test_toggle_off_clears() {
        let start = Instant::now();
        let mut bench = BenchmarkController::new(true, 90.0).unwrap();
        bench.begin(start);
        bench.observe(0.95, 10, start + Duration::from_secs(1));
        assert!(bench.result().is_some());

        bench.set_enabled(false);
        assert!(bench.result().is_none());
        assert!(bench.started_at().is_none());

        bench.set_enabled(true);
        assert!(matches!(
            bench.observe(0.95, 20, start + Duration::from_secs(2)),
            BenchmarkOutcome::Crossed(_)
        ));
    }

    #[test]
    fn test_enabled_mid_session_starts_clock_at_first_tick() {
        let start = Instant::now();
        let mut bench = BenchmarkController::new(false, 90.0).unwrap();
        bench.begin(start);
        bench.set_enabled(true);

        assert_eq!(bench.observe(0.1, 1, start + Duration::from_secs(3)), BenchmarkOutcome::Pending);
        match bench.observe(0.95, 2, start + Duration::from_secs(5)) {
            BenchmarkOutcome::Crossed(result) => assert!((result.elapsed_seconds - 2.0).abs() < 1e-9),
            other => panic!("expected crossing, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_target() {
        assert!(matches!(BenchmarkController::new(true, 0.0), Err(DriverError::ConfigError(_))));
        let mut bench = BenchmarkController::new(true, 90.0).unwrap();
        assert!(bench.set_target_percent(120.0).is_err());
        assert_eq!(bench.target_fitness(), 0.9);
    }
}
