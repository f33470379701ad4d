// src/runtime/scheduler.rs
//! Cooperative step scheduler
//!
//! One tick advances the current engine by a whole batch, reads the result
//! back, and feeds the throughput meter and the benchmark. Ticks are never
//! interrupted: `stop()` only prevents the next one.
//!
//! # Batching
//!
//! ```text
//! visual updates on   →  batch = update_interval (1-100)   image read every tick
//! visual updates off  →  batch = throughput_batch_size     image read only when forced
//! ```
//!
//! Settings live in [`LoopSettings`] and are read at tick time, so a change
//! takes effect on the very next tick without rebuilding anything.

use crate::observability::{BEST_FITNESS, GENERATIONS_PER_SECOND, GENERATIONS_TOTAL, TICK_DURATION_SECONDS};
use crate::runtime::benchmark::{BenchmarkController, BenchmarkOutcome};
use crate::runtime::engine::StepParams;
use crate::runtime::lifecycle::{EngineLifecycleManager, ReadBack};
use crate::runtime::throughput::ThroughputMeter;
use crate::utils::config::{DriverConfig, UPDATE_INTERVAL_RANGE};
use crate::utils::errors::{DriverError, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Instant;
use tracing::{debug, error, info, trace};
use ulid::Ulid;

/// Identity of one play session (start → stop)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Ulid);

impl SessionId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Settings consulted on every tick
#[derive(Debug, Clone, PartialEq)]
pub struct LoopSettings {
    /// Generations per tick while visual updates are on
    pub update_interval: u32,

    /// Read the best image back on every tick
    pub visual_updates: bool,

    /// Generations per tick while visual updates are off
    pub throughput_batch_size: u32,

    /// Accumulated generations between housekeeping passes
    pub housekeeping_interval: u64,

    /// Forwarded to every engine step
    pub step: StepParams,
}

impl LoopSettings {
    pub fn from_config(config: &DriverConfig) -> Self {
        Self {
            update_interval: config.scheduler.update_interval,
            visual_updates: config.scheduler.visual_updates,
            throughput_batch_size: config.scheduler.throughput_batch_size,
            housekeeping_interval: config.scheduler.housekeeping_interval,
            step: StepParams {
                mutation_rate: config.evolution.mutation_rate,
                auto_mutation: config.evolution.auto_mutation,
                parallel: config.evolution.parallel,
            },
        }
    }

    /// Generations to advance on the next tick; always at least 1
    pub fn batch_size(&self) -> u32 {
        if self.visual_updates {
            let (min, max) = UPDATE_INTERVAL_RANGE;
            self.update_interval.clamp(min, max)
        } else {
            self.throughput_batch_size.max(1)
        }
    }
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self::from_config(&DriverConfig::default())
    }
}

/// One `(generation, fitness)` point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitnessSample {
    pub generation: u64,
    pub fitness: f64,
}

/// Fitness samples for charting, trimmed during housekeeping
#[derive(Debug, Clone)]
pub struct FitnessHistory {
    samples: VecDeque<FitnessSample>,
    capacity: usize,
}

impl FitnessHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, generation: u64, fitness: f64) {
        self.samples.push_back(FitnessSample { generation, fitness });
    }

    /// Drop the oldest samples beyond capacity; returns how many were dropped
    pub fn trim(&mut self) -> usize {
        let excess = self.samples.len().saturating_sub(self.capacity);
        self.samples.drain(..excess);
        excess
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn to_vec(&self) -> Vec<FitnessSample> {
        self.samples.iter().copied().collect()
    }
}

/// Collaborators a tick works on
pub struct TickContext<'a> {
    pub lifecycle: &'a mut EngineLifecycleManager,
    pub meter: &'a mut ThroughputMeter,
    pub benchmark: &'a mut BenchmarkController,
    pub history: &'a mut FitnessHistory,
}

/// What one tick did
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub batch_size: u32,
    pub read_back: ReadBack,

    /// Published when a throughput window closed on this tick
    pub rate: Option<u32>,
    pub benchmark: BenchmarkOutcome,
    pub housekeeping: bool,

    /// False when the tick itself stopped the scheduler
    pub continue_running: bool,
}

/// Scheduler phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerPhase {
    Idle,
    Running,
}

/// Frame-paced stepping state machine
#[derive(Debug, Clone)]
pub struct StepScheduler {
    running: bool,
    settings: LoopSettings,
    last_batch_size: u32,
    generation_counter: u64,
    housekeeping_mark: u64,
    session: Option<SessionId>,
    ticks: u64,
}

impl StepScheduler {
    pub fn new(settings: LoopSettings) -> Self {
        let last_batch_size = settings.batch_size();
        Self {
            running: false,
            settings,
            last_batch_size,
            generation_counter: 0,
            housekeeping_mark: 0,
            session: None,
            ticks: 0,
        }
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    /// Mutable settings; changes apply from the next tick
    pub fn settings_mut(&mut self) -> &mut LoopSettings {
        &mut self.settings
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn phase(&self) -> SchedulerPhase {
        if self.running {
            SchedulerPhase::Running
        } else {
            SchedulerPhase::Idle
        }
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    /// Batch size used by the most recent tick (or the next one, before any tick)
    pub fn batch_size(&self) -> u32 {
        self.last_batch_size
    }

    /// Generations advanced by this scheduler since the engine was installed
    pub fn generation_counter(&self) -> u64 {
        self.generation_counter
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Begin a play session; requires an installed engine
    pub fn start(&mut self, ctx: &mut TickContext<'_>, now: Instant) -> Result<SessionId> {
        if !ctx.lifecycle.has_engine() {
            return Err(DriverError::NotReady("no engine installed".into()));
        }
        if let (true, Some(session)) = (self.running, self.session) {
            return Ok(session);
        }

        let session = SessionId::new();
        self.running = true;
        self.session = Some(session);
        ctx.meter.restart(now);
        ctx.benchmark.begin(now);

        info!("Play session {} started (batch size {})", session, self.settings.batch_size());
        Ok(session)
    }

    /// Stop after the current tick; returns whether a session was running
    pub fn stop(&mut self) -> bool {
        let was_running = self.running;
        self.running = false;
        if was_running {
            if let Some(session) = self.session.take() {
                info!("Play session {} stopped after {} generations", session, self.generation_counter);
            }
        }
        was_running
    }

    /// Forget accumulated generations (new engine installed)
    pub fn reset_counters(&mut self) {
        self.generation_counter = 0;
        self.housekeeping_mark = 0;
        self.ticks = 0;
    }

    /// Run one tick against the currently installed engine
    pub fn tick(&mut self, ctx: &mut TickContext<'_>, now: Instant) -> Result<TickReport> {
        if !self.running {
            return Err(DriverError::NotReady("scheduler is idle".into()));
        }
        if !ctx.lifecycle.has_engine() {
            self.stop();
            return Err(DriverError::NotReady("no engine installed".into()));
        }

        let started = Instant::now();
        let batch_size = self.settings.batch_size();
        self.last_batch_size = batch_size;

        if let Err(e) = ctx.lifecycle.step(batch_size, &self.settings.step) {
            return Err(self.abort(e));
        }
        self.generation_counter += batch_size as u64;
        self.ticks += 1;

        let mut read_back = match ctx.lifecycle.read_back(self.settings.visual_updates) {
            Ok(read_back) => read_back,
            Err(e) => return Err(self.abort(e)),
        };

        ctx.history.push(read_back.generation, read_back.fitness);
        let housekeeping =
            self.generation_counter - self.housekeeping_mark >= self.settings.housekeeping_interval;
        if housekeeping {
            let dropped = ctx.history.trim();
            self.housekeeping_mark = self.generation_counter;
            trace!("Housekeeping at {} generations, dropped {} samples", self.generation_counter, dropped);
        }

        let rate = ctx.meter.record_tick(batch_size as u64, now);

        let benchmark = ctx.benchmark.observe(read_back.fitness, read_back.generation, now);
        if let BenchmarkOutcome::Crossed(_) = benchmark {
            // the displayed image must match the crossing generation
            if read_back.best_image.is_none() {
                match ctx.lifecycle.read_back(true) {
                    Ok(forced) => read_back.best_image = forced.best_image,
                    Err(e) => return Err(self.abort(e)),
                }
            }
            self.stop();
        }

        metrics::counter!(GENERATIONS_TOTAL).increment(batch_size as u64);
        metrics::gauge!(BEST_FITNESS).set(read_back.fitness);
        if let Some(rate) = rate {
            metrics::gauge!(GENERATIONS_PER_SECOND).set(rate as f64);
        }
        metrics::histogram!(TICK_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

        debug!(
            "Tick {}: +{} generations → {} (fitness {:.4})",
            self.ticks, batch_size, read_back.generation, read_back.fitness
        );

        Ok(TickReport {
            batch_size,
            read_back,
            rate,
            benchmark,
            housekeeping,
            continue_running: self.running,
        })
    }

    fn abort(&mut self, err: DriverError) -> DriverError {
        error!("Aborting run after {} generations: {}", self.generation_counter, err);
        self.stop();
        err
    }
}
