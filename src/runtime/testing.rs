// src/runtime/testing.rs
//! Scripted collaborators for driver tests

use crate::imaging::ImageSource;
use crate::runtime::engine::{rgba_len, EngineFactory, EvolutionEngine, StepParams};
use crate::runtime::parallel_pool::PoolBackend;
use crate::utils::errors::{DriverError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Fitness curve and failure script for [`ScriptedEngine`]
#[derive(Debug, Clone)]
pub struct ScriptedSpec {
    /// Fitness gained per generation (capped at 1.0)
    pub slope: f64,

    /// `(generation, fitness)`: fitness jumps to this value from that generation on
    pub threshold: Option<(u64, f64)>,

    /// Reported fitness regardless of generation
    pub fitness_override: Option<f64>,

    /// Reported image length instead of `grid² × 4`
    pub image_len: Option<usize>,

    /// Step calls that would reach this generation fail
    pub fail_at: Option<u64>,

    /// Sleep inside every step call
    pub step_delay: Duration,
}

impl ScriptedSpec {
    pub fn linear(slope: f64) -> Self {
        Self {
            slope,
            threshold: None,
            fitness_override: None,
            image_len: None,
            fail_at: None,
            step_delay: Duration::ZERO,
        }
    }

    /// Fitness stays at `before` until `generation`, then becomes `after`
    pub fn threshold(generation: u64, before: f64, after: f64) -> Self {
        Self {
            threshold: Some((generation, after)),
            fitness_override: Some(before),
            ..Self::linear(0.0)
        }
    }

    pub fn with_fitness_override(mut self, fitness: f64) -> Self {
        self.fitness_override = Some(fitness);
        self
    }

    pub fn with_image_len(mut self, len: usize) -> Self {
        self.image_len = Some(len);
        self
    }

    pub fn failing_at(mut self, generation: u64) -> Self {
        self.fail_at = Some(generation);
        self
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }
}

#[derive(Default)]
struct Counters {
    created: AtomicUsize,
    live: AtomicUsize,
    single_steps: AtomicUsize,
    batch_calls: Mutex<Vec<u32>>,
    /// serial of the engine each step call went to
    step_log: Mutex<Vec<usize>>,
}

pub struct ScriptedEngine {
    serial: usize,
    script: ScriptedSpec,
    grid_dimension: u32,
    generation: u64,
    counters: Arc<Counters>,
}

impl ScriptedEngine {
    fn advance(&mut self, count: u64) -> anyhow::Result<()> {
        if let Some(fail_at) = self.script.fail_at {
            if self.generation + count >= fail_at {
                anyhow::bail!("population state corrupted at generation {}", self.generation);
            }
        }
        if !self.script.step_delay.is_zero() {
            std::thread::sleep(self.script.step_delay);
        }
        self.counters.step_log.lock().push(self.serial);
        self.generation += count;
        Ok(())
    }
}

impl EvolutionEngine for ScriptedEngine {
    fn step(&mut self, _params: &StepParams) -> anyhow::Result<()> {
        self.counters.single_steps.fetch_add(1, Ordering::SeqCst);
        self.advance(1)
    }

    fn step_batch(&mut self, count: u32, _params: &StepParams) -> anyhow::Result<()> {
        self.counters.batch_calls.lock().push(count);
        self.advance(count as u64)
    }

    fn generation(&self) -> u64 {
        self.generation
    }

    fn best_fitness(&self) -> f64 {
        if let Some((at, fitness)) = self.script.threshold {
            if self.generation >= at {
                return fitness;
            }
        }
        if let Some(fitness) = self.script.fitness_override {
            return fitness;
        }
        (self.script.slope * self.generation as f64).min(1.0)
    }

    fn best_image(&self) -> Vec<u8> {
        let len = self.script.image_len.unwrap_or_else(|| rgba_len(self.grid_dimension));
        vec![(self.generation % 256) as u8; len]
    }
}

impl Drop for ScriptedEngine {
    fn drop(&mut self) {
        self.counters.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Factory handing out [`ScriptedEngine`]s that share counters
pub struct ScriptedEngineFactory {
    script: ScriptedSpec,
    fail_with: Option<String>,
    counters: Arc<Counters>,
}

impl ScriptedEngineFactory {
    pub fn new(script: ScriptedSpec) -> Self {
        Self {
            script,
            fail_with: None,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::new(ScriptedSpec::linear(0.0))
        }
    }

    pub fn created(&self) -> usize {
        self.counters.created.load(Ordering::SeqCst)
    }

    pub fn live_engines(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    pub fn single_steps(&self) -> usize {
        self.counters.single_steps.load(Ordering::SeqCst)
    }

    pub fn batch_calls(&self) -> Vec<u32> {
        self.counters.batch_calls.lock().clone()
    }

    /// Engine serial (1-based creation order) of every step call
    pub fn step_log(&self) -> Vec<usize> {
        self.counters.step_log.lock().clone()
    }
}

impl EngineFactory for ScriptedEngineFactory {
    fn create(
        &self,
        target: &[u8],
        _population_size: usize,
        grid_dimension: u32,
    ) -> anyhow::Result<Box<dyn EvolutionEngine>> {
        if let Some(message) = &self.fail_with {
            anyhow::bail!("{}", message);
        }
        anyhow::ensure!(target.len() == rgba_len(grid_dimension), "target size mismatch");

        let serial = self.counters.created.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.live.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(ScriptedEngine {
            serial,
            script: self.script.clone(),
            grid_dimension,
            generation: 0,
            counters: Arc::clone(&self.counters),
        }))
    }
}

/// Pool backend that counts initialization calls
pub struct CountingPoolBackend {
    calls: AtomicUsize,
    delay: Duration,
    fail_with: Option<String>,
}

impl CountingPoolBackend {
    pub fn succeeding(delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay,
            fail_with: None,
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::succeeding(Duration::ZERO)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PoolBackend for CountingPoolBackend {
    fn init_pool(&self, _worker_count: usize) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        match &self.fail_with {
            Some(message) => anyhow::bail!("{}", message),
            None => Ok(()),
        }
    }
}

/// Solid-colour targets generated in memory
pub struct MemoryImageSource {
    loads: AtomicUsize,
    /// Loads with this index or later fail
    fail_from: Option<usize>,
    delay: Duration,
}

impl MemoryImageSource {
    pub fn new() -> Self {
        Self {
            loads: AtomicUsize::new(0),
            fail_from: None,
            delay: Duration::ZERO,
        }
    }

    pub fn failing() -> Self {
        Self::failing_after(0)
    }

    pub fn failing_after(successful_loads: usize) -> Self {
        Self {
            fail_from: Some(successful_loads),
            ..Self::new()
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl ImageSource for MemoryImageSource {
    fn load_target_image(&self, source: &str, width: u32, height: u32) -> Result<Vec<u8>> {
        let index = self.loads.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        if self.fail_from.is_some_and(|from| index >= from) {
            return Err(DriverError::ImageLoadFailed(format!("{}: not found", source)));
        }
        Ok(vec![128u8; width as usize * height as usize * 4])
    }
}
