// src/runtime/driver.rs
//! Driver facade
//!
//! Owns the lifecycle manager, scheduler, meter and benchmark behind one
//! async mutex, runs the frame-paced loop as a tokio task, and publishes a
//! [`DriverSnapshot`] on a watch channel after every tick and command.
//!
//! # Setup
//!
//! ```text
//! Unready ──setup()──► isolation check ──► pool init ──► image load + engine build ──► Ready
//!                            │                 │                    │
//!                            ▼                 ▼                    ▼
//!                         Blocked            Failed              Unready
//!                      (permanent)        (permanent)          (retryable)
//! ```
//!
//! # Ticks
//!
//! Each frame the loop hands one tick to the blocking pool. The tick holds
//! the state lock for its whole duration, so commands queue behind it and
//! are applied between ticks.

use crate::imaging::ImageSource;
use crate::observability::ENGINE_RECREATIONS_TOTAL;
use crate::runtime::benchmark::{BenchmarkController, BenchmarkResult};
use crate::runtime::engine::{EngineFactory, EvolutionEngine};
use crate::runtime::isolation::IsolationGate;
use crate::runtime::lifecycle::{EngineLifecycleManager, EngineParams, InstallOutcome, ReadBack, RecreateToken};
use crate::runtime::parallel_pool::ParallelismGate;
use crate::runtime::scheduler::{FitnessHistory, FitnessSample, LoopSettings, SessionId, StepScheduler, TickContext};
use crate::runtime::throughput::ThroughputMeter;
use crate::utils::config::{
    validate_grid_dimension, validate_mutation_rate, validate_population_size, validate_target_percent,
    validate_update_interval, DriverConfig,
};
use crate::utils::errors::{DriverError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Setup progress as seen by the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    /// `setup()` not yet called, or the last attempt failed in a retryable way
    Unready,
    Loading,
    Ready,

    /// Isolation precondition failed; only a host reload helps
    Blocked,

    /// Worker pool initialization failed; never retried
    Failed,
}

/// Read-only view published after every tick and command
#[derive(Debug, Clone, Serialize)]
pub struct DriverSnapshot {
    pub readiness: Readiness,
    pub is_loaded: bool,
    pub is_playing: bool,

    /// An engine recreation is in flight
    pub recreating: bool,
    pub engine_id: Option<u64>,

    pub generation: u64,
    pub fitness: f64,

    /// RGBA8 of the best individual, refreshed per the visual-update policy
    #[serde(skip)]
    pub best_image: Option<Bytes>,

    pub population_size: usize,
    pub grid_dimension: u32,
    pub mutation_rate: f64,
    pub auto_mutation: bool,
    pub parallel: bool,
    pub update_interval: u32,
    pub visual_updates: bool,
    pub batch_size: u32,

    pub generations_per_second: Option<u32>,
    pub benchmark_enabled: bool,
    pub benchmark_target_percent: f64,
    pub benchmark: Option<BenchmarkResult>,
    pub history: Vec<FitnessSample>,

    pub session: Option<SessionId>,
    pub worker_count: Option<usize>,
    pub last_error: Option<String>,
}

/// Collaborators the driver is built from
pub struct DriverDeps {
    pub engine_factory: Arc<dyn EngineFactory>,
    pub image_source: Arc<dyn ImageSource>,
    pub pool: Arc<ParallelismGate>,
    pub isolation: IsolationGate,
}

struct DriverState {
    readiness: Readiness,
    fatal: Option<DriverError>,
    isolation_passed: bool,
    worker_count: Option<usize>,

    /// Parameters the next engine will be built with
    params: EngineParams,
    image_path: String,

    lifecycle: EngineLifecycleManager,
    scheduler: StepScheduler,
    meter: ThroughputMeter,
    benchmark: BenchmarkController,
    history: FitnessHistory,

    pending: Option<RecreateToken>,
    last_read: Option<ReadBack>,
    last_error: Option<DriverError>,
    session_cancel: Option<CancellationToken>,
}

impl DriverState {
    fn ensure_playable(&self) -> Result<()> {
        if self.readiness != Readiness::Ready || !self.lifecycle.has_engine() {
            return Err(DriverError::NotReady(format!("driver is {:?}", self.readiness)));
        }
        if self.pending.is_some() {
            return Err(DriverError::NotReady("engine recreation in progress".into()));
        }
        Ok(())
    }

    fn start_session(&mut self, now: Instant) -> Result<SessionId> {
        let DriverState {
            lifecycle,
            meter,
            benchmark,
            history,
            scheduler,
            ..
        } = &mut *self;
        let mut ctx = TickContext {
            lifecycle,
            meter,
            benchmark,
            history,
        };
        scheduler.start(&mut ctx, now)
    }

    /// Stop the scheduler and cancel the session's pending frames
    fn stop_session(&mut self) {
        self.scheduler.stop();
        if let Some(cancel) = self.session_cancel.take() {
            cancel.cancel();
        }
    }

    /// Run one tick; returns whether the loop should continue
    fn run_tick(&mut self, now: Instant) -> bool {
        let DriverState {
            lifecycle,
            meter,
            benchmark,
            history,
            scheduler,
            ..
        } = &mut *self;
        let mut ctx = TickContext {
            lifecycle,
            meter,
            benchmark,
            history,
        };

        match scheduler.tick(&mut ctx, now) {
            Ok(report) => {
                let mut read_back = report.read_back;
                if read_back.best_image.is_none() {
                    read_back.best_image = self.last_read.take().and_then(|previous| previous.best_image);
                }
                self.last_read = Some(read_back);

                if !report.continue_running {
                    self.stop_session();
                }
                report.continue_running
            }
            Err(e) => {
                self.last_error = Some(e);
                self.stop_session();
                false
            }
        }
    }

    /// Read the full state including the image
    fn refresh(&mut self) {
        if !self.lifecycle.has_engine() {
            return;
        }
        match self.lifecycle.read_back(true) {
            Ok(read_back) => self.last_read = Some(read_back),
            Err(e) => {
                warn!("Forced read-back failed: {}", e);
                self.last_error = Some(e);
            }
        }
    }

    /// Stop the session and claim the newest recreation token
    fn begin_rebuild(&mut self, reason: &'static str) -> Result<RebuildRequest> {
        match self.readiness {
            Readiness::Ready | Readiness::Loading => {}
            other => {
                return Err(DriverError::NotReady(format!("cannot run {} while {:?}", reason, other)));
            }
        }

        self.stop_session();
        let token = self.lifecycle.begin_recreate();
        self.pending = Some(token);
        Ok(RebuildRequest {
            reason,
            token,
            params: self.params,
            source: self.image_path.clone(),
            factory: self.lifecycle.factory(),
        })
    }

    /// Forget a recreation whose task never reported back
    fn abandon_rebuild(&mut self, token: RecreateToken) {
        if !self.lifecycle.is_latest(token) {
            return;
        }
        self.pending = None;
        if !self.lifecycle.has_engine() && self.readiness == Readiness::Loading {
            self.readiness = Readiness::Unready;
        }
    }

    fn on_installed(&mut self, now: Instant) {
        self.scheduler.reset_counters();
        self.benchmark.clear();
        self.history.clear();
        self.meter.restart(now);
        self.readiness = Readiness::Ready;
        self.last_error = None;
        self.last_read = None;
        self.refresh();

        if self.lifecycle.installed_total() > 1 {
            metrics::counter!(ENGINE_RECREATIONS_TOTAL).increment(1);
        }
    }

    fn snapshot(&self) -> DriverSnapshot {
        let settings = self.scheduler.settings();
        let read = self.last_read.as_ref();

        DriverSnapshot {
            readiness: self.readiness,
            is_loaded: self.readiness == Readiness::Ready && self.lifecycle.has_engine(),
            is_playing: self.scheduler.is_running(),
            recreating: self.pending.is_some(),
            engine_id: self.lifecycle.current_id().map(|id| id.0),
            generation: read.map_or(0, |r| r.generation),
            fitness: read.map_or(0.0, |r| r.fitness),
            best_image: read.and_then(|r| r.best_image.clone()),
            population_size: self.params.population_size,
            grid_dimension: self.params.grid_dimension,
            mutation_rate: settings.step.mutation_rate,
            auto_mutation: settings.step.auto_mutation,
            parallel: settings.step.parallel,
            update_interval: settings.update_interval,
            visual_updates: settings.visual_updates,
            batch_size: settings.batch_size(),
            generations_per_second: self.meter.rate(),
            benchmark_enabled: self.benchmark.is_enabled(),
            benchmark_target_percent: self.benchmark.target_fitness() * 100.0,
            benchmark: self.benchmark.result().cloned(),
            history: self.history.to_vec(),
            session: self.scheduler.session(),
            worker_count: self.worker_count,
            last_error: self.last_error.as_ref().map(ToString::to_string),
        }
    }
}

/// Everything a build needs, captured under the lock when the request is made
struct RebuildRequest {
    reason: &'static str,
    token: RecreateToken,
    params: EngineParams,
    source: String,
    factory: Arc<dyn EngineFactory>,
}

/// Execution driver for one evolution engine
pub struct Driver {
    state: Arc<Mutex<DriverState>>,
    image_source: Arc<dyn ImageSource>,
    pool: Arc<ParallelismGate>,
    isolation: IsolationGate,
    frame_period: Duration,
    snapshots: Arc<watch::Sender<DriverSnapshot>>,
    shutdown: CancellationToken,
    loop_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Driver {
    /// Build an unready driver; nothing runs until `setup()`
    pub fn new(config: &DriverConfig, deps: DriverDeps) -> Result<Self> {
        config.validate()?;

        let settings = LoopSettings::from_config(config);
        let state = DriverState {
            readiness: Readiness::Unready,
            fatal: None,
            isolation_passed: false,
            worker_count: None,
            params: EngineParams {
                population_size: config.evolution.population_size,
                grid_dimension: config.evolution.grid_dimension,
            },
            image_path: config.image.source.clone(),
            lifecycle: EngineLifecycleManager::new(deps.engine_factory),
            scheduler: StepScheduler::new(settings),
            meter: ThroughputMeter::new(Instant::now()),
            benchmark: BenchmarkController::from_config(&config.benchmark)?,
            history: FitnessHistory::new(config.scheduler.history_capacity),
            pending: None,
            last_read: None,
            last_error: None,
            session_cancel: None,
        };

        let (snapshots, _) = watch::channel(state.snapshot());

        Ok(Self {
            state: Arc::new(Mutex::new(state)),
            image_source: deps.image_source,
            pool: deps.pool,
            isolation: deps.isolation,
            frame_period: Duration::from_secs_f64(1.0 / config.scheduler.frame_rate_hz as f64),
            snapshots: Arc::new(snapshots),
            shutdown: CancellationToken::new(),
            loop_task: parking_lot::Mutex::new(None),
        })
    }

    /// Check isolation, initialize the pool, and build the first engine
    pub async fn setup(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            match state.readiness {
                Readiness::Blocked | Readiness::Failed => {
                    return Err(state
                        .fatal
                        .clone()
                        .unwrap_or(DriverError::IsolationUnavailable));
                }
                Readiness::Ready => return Ok(()),
                Readiness::Loading => return Err(DriverError::NotReady("setup already in progress".into())),
                Readiness::Unready => {}
            }

            if !state.isolation_passed {
                if let Err(e) = self.isolation.check() {
                    error!("Setup blocked: {}", e);
                    state.readiness = Readiness::Blocked;
                    state.fatal = Some(e.clone());
                    state.last_error = Some(e.clone());
                    self.publish(&state);
                    return Err(e);
                }
                state.isolation_passed = true;
            }

            state.readiness = Readiness::Loading;
            self.publish(&state);
        }

        info!("Setting up driver");
        // runs to completion even if this caller stops waiting
        let task = tokio::spawn(self.rebuilder().complete_setup(Arc::clone(&self.pool)));
        match task.await {
            Ok(result) => result,
            Err(e) => {
                error!("Setup task did not complete: {}", e);
                let mut state = self.state.lock().await;
                state.pending = None;
                if state.readiness == Readiness::Loading && !state.lifecycle.has_engine() {
                    state.readiness = Readiness::Unready;
                }
                self.publish(&state);
                Err(DriverError::NotReady(format!("setup task failed: {}", e)))
            }
        }
    }

    /// Start the frame loop; requires a tokio runtime
    pub async fn play(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| DriverError::NotReady(format!("no async runtime: {}", e)))?;

        let mut state = self.state.lock().await;
        state.ensure_playable()?;
        if state.scheduler.is_running() {
            return Ok(());
        }

        let session = state.start_session(Instant::now())?;
        let cancel = self.shutdown.child_token();
        state.session_cancel = Some(cancel.clone());
        state.last_error = None;
        self.publish(&state);
        drop(state);

        let frames = FrameLoop {
            state: Arc::clone(&self.state),
            snapshots: Arc::clone(&self.snapshots),
            session,
            cancel,
            frame_period: self.frame_period,
        };
        let task = runtime.spawn(frames.run());
        *self.loop_task.lock() = Some(task);

        Ok(())
    }

    /// Stop after the in-flight tick and refresh the displayed image
    pub async fn pause(&self) {
        let mut state = self.state.lock().await;
        state.stop_session();
        state.refresh();
        self.publish(&state);
    }

    /// Play when paused, pause when playing; returns the new playing state
    pub async fn toggle_play(&self) -> Result<bool> {
        let playing = self.state.lock().await.scheduler.is_running();
        if playing {
            self.pause().await;
            Ok(false)
        } else {
            self.play().await?;
            Ok(true)
        }
    }

    /// Rebuild the engine from scratch with the current parameters
    pub async fn reset(&self) -> Result<()> {
        self.recreate("reset").await
    }

    /// Change population size; recreates the engine when one exists
    pub async fn set_population_size(&self, population_size: usize) -> Result<()> {
        validate_population_size(population_size)?;
        self.change_params(|params| params.population_size = population_size, "population change")
            .await
    }

    /// Change grid dimension; recreates the engine when one exists
    pub async fn set_grid_dimension(&self, grid_dimension: u32) -> Result<()> {
        validate_grid_dimension(grid_dimension)?;
        self.change_params(|params| params.grid_dimension = grid_dimension, "grid change")
            .await
    }

    pub async fn set_mutation_rate(&self, mutation_rate: f64) -> Result<()> {
        validate_mutation_rate(mutation_rate)?;
        self.update_settings(|settings| settings.step.mutation_rate = mutation_rate)
            .await;
        Ok(())
    }

    pub async fn set_auto_mutation(&self, enabled: bool) {
        self.update_settings(|settings| settings.step.auto_mutation = enabled)
            .await;
    }

    pub async fn set_parallel(&self, enabled: bool) {
        self.update_settings(|settings| settings.step.parallel = enabled)
            .await;
    }

    pub async fn set_update_interval(&self, update_interval: u32) -> Result<()> {
        validate_update_interval(update_interval)?;
        self.update_settings(|settings| settings.update_interval = update_interval)
            .await;
        Ok(())
    }

    pub async fn set_visual_updates(&self, enabled: bool) {
        self.update_settings(|settings| settings.visual_updates = enabled)
            .await;
    }

    /// Configure benchmark mode; switching it off clears any result
    pub async fn set_benchmark(&self, enabled: bool, target_percent: f64) -> Result<()> {
        validate_target_percent(target_percent)?;

        let mut state = self.state.lock().await;
        let was_enabled = state.benchmark.is_enabled();
        state.benchmark.set_target_percent(target_percent)?;
        state.benchmark.set_enabled(enabled);
        if enabled && !was_enabled && state.scheduler.is_running() {
            state.benchmark.begin(Instant::now());
        }

        info!("Benchmark mode {} (target {:.1}%)", if enabled { "on" } else { "off" }, target_percent);
        self.publish(&state);
        Ok(())
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> DriverSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receive a snapshot after every tick and command
    pub fn subscribe(&self) -> watch::Receiver<DriverSnapshot> {
        self.snapshots.subscribe()
    }

    pub async fn last_error(&self) -> Option<DriverError> {
        self.state.lock().await.last_error.clone()
    }

    /// Stop the loop and release the engine
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.lock().await;
            state.stop_session();
            // builds still in flight must not install after this point
            state.lifecycle.begin_recreate();
            state.pending = None;
            state.lifecycle.release();
            if state.readiness == Readiness::Ready || state.readiness == Readiness::Loading {
                state.readiness = Readiness::Unready;
            }
            self.publish(&state);
        }

        let task = self.loop_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Frame loop ended abnormally: {}", e);
            }
        }
        info!("Driver shut down");
    }

    async fn change_params<F>(&self, apply: F, reason: &'static str) -> Result<()>
    where
        F: FnOnce(&mut EngineParams),
    {
        let request = {
            let mut state = self.state.lock().await;
            let mut params = state.params;
            apply(&mut params);
            if params == state.params {
                return Ok(());
            }

            if !state.lifecycle.has_engine() && state.pending.is_none() {
                state.params = params;
                self.publish(&state);
                return Ok(());
            }

            let previous = std::mem::replace(&mut state.params, params);
            match state.begin_rebuild(reason) {
                Ok(request) => {
                    self.publish(&state);
                    request
                }
                Err(e) => {
                    state.params = previous;
                    return Err(e);
                }
            }
        };

        self.finish_rebuild(request).await
    }

    async fn update_settings<F>(&self, apply: F)
    where
        F: FnOnce(&mut LoopSettings),
    {
        let mut state = self.state.lock().await;
        apply(state.scheduler.settings_mut());
        self.publish(&state);
    }

    /// Stop and rebuild with the current parameters
    async fn recreate(&self, reason: &'static str) -> Result<()> {
        let request = {
            let mut state = self.state.lock().await;
            let request = state.begin_rebuild(reason)?;
            self.publish(&state);
            request
        };

        self.finish_rebuild(request).await
    }

    /// Build and install on a spawned task the caller only waits on
    async fn finish_rebuild(&self, request: RebuildRequest) -> Result<()> {
        let token = request.token;
        let reason = request.reason;

        match tokio::spawn(self.rebuilder().run(request)).await {
            Ok(result) => result,
            Err(e) => {
                error!("Engine {} task did not complete: {}", reason, e);
                let mut state = self.state.lock().await;
                state.abandon_rebuild(token);
                self.publish(&state);
                Err(DriverError::EngineCreateFailed(format!("{} task failed: {}", reason, e)))
            }
        }
    }

    fn rebuilder(&self) -> Rebuilder {
        Rebuilder {
            state: Arc::clone(&self.state),
            snapshots: Arc::clone(&self.snapshots),
            image_source: Arc::clone(&self.image_source),
        }
    }

    fn publish(&self, state: &DriverState) {
        self.snapshots.send_replace(state.snapshot());
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Setup and recreation work that outlives the command that started it
struct Rebuilder {
    state: Arc<Mutex<DriverState>>,
    snapshots: Arc<watch::Sender<DriverSnapshot>>,
    image_source: Arc<dyn ImageSource>,
}

impl Rebuilder {
    fn publish(&self, state: &DriverState) {
        self.snapshots.send_replace(state.snapshot());
    }

    /// Pool initialization followed by the first engine build
    async fn complete_setup(self, pool: Arc<ParallelismGate>) -> Result<()> {
        let initialized = pool.ensure_initialized().await;

        let request = {
            let mut state = self.state.lock().await;
            match initialized {
                Ok(context) => state.worker_count = Some(context.worker_count),
                Err(e) => {
                    error!("Setup failed: {}", e);
                    if state.readiness == Readiness::Loading {
                        state.readiness = Readiness::Failed;
                        state.fatal = Some(e.clone());
                    }
                    state.last_error = Some(e.clone());
                    self.publish(&state);
                    return Err(e);
                }
            }

            if !matches!(state.readiness, Readiness::Loading | Readiness::Ready) {
                info!("Setup interrupted while {:?}", state.readiness);
                return Err(DriverError::NotReady("setup interrupted by shutdown".into()));
            }

            let request = state.begin_rebuild("setup")?;
            self.publish(&state);
            request
        };

        self.run(request).await
    }

    /// Build off the lock, install if still the latest request
    async fn run(self, request: RebuildRequest) -> Result<()> {
        let RebuildRequest {
            reason,
            token,
            params,
            source,
            factory,
        } = request;

        info!(
            "Building engine for {} (population {}, grid {}x{})",
            reason, params.population_size, params.grid_dimension, params.grid_dimension
        );

        let image_source = Arc::clone(&self.image_source);
        let built = tokio::task::spawn_blocking(move || -> Result<Box<dyn EvolutionEngine>> {
            let target = image_source.load_target_image(&source, params.grid_dimension, params.grid_dimension)?;
            EngineLifecycleManager::build(factory.as_ref(), &target, params)
        })
        .await
        .map_err(|e| DriverError::EngineCreateFailed(format!("build task failed: {}", e)))
        .and_then(|built| built);

        let mut state = self.state.lock().await;
        if !state.lifecycle.is_latest(token) {
            debug!("Build for {} superseded by a newer request", reason);
            return built.map(|_| ());
        }
        state.pending = None;

        if !matches!(state.readiness, Readiness::Ready | Readiness::Loading) {
            self.publish(&state);
            return Err(DriverError::NotReady(format!(
                "{} finished while {:?}",
                reason, state.readiness
            )));
        }

        let outcome = match built {
            Ok(engine) => {
                debug_assert!(!state.scheduler.is_running());
                if let InstallOutcome::Installed(_) = state.lifecycle.install(token, params, engine) {
                    state.on_installed(Instant::now());
                }
                Ok(())
            }
            Err(e) => {
                error!("Engine {} failed: {}", reason, e);
                match state.lifecycle.current_params() {
                    Some(installed) => state.params = installed,
                    None => state.readiness = Readiness::Unready,
                }
                state.last_error = Some(e.clone());
                Err(e)
            }
        };

        self.publish(&state);
        outcome
    }
}

/// One play session's frame-paced tick loop
struct FrameLoop {
    state: Arc<Mutex<DriverState>>,
    snapshots: Arc<watch::Sender<DriverSnapshot>>,
    session: SessionId,
    cancel: CancellationToken,
    frame_period: Duration,
}

impl FrameLoop {
    async fn run(self) {
        let mut frames = tokio::time::interval(self.frame_period);
        frames.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!("Frame loop for session {} started ({:?} per frame)", self.session, self.frame_period);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = frames.tick() => {}
            }

            let state = Arc::clone(&self.state);
            let snapshots = Arc::clone(&self.snapshots);
            let session = self.session;

            let tick = tokio::task::spawn_blocking(move || {
                let mut state = state.blocking_lock();
                if state.scheduler.session() != Some(session) || !state.scheduler.is_running() {
                    return false;
                }
                let keep_running = state.run_tick(Instant::now());
                snapshots.send_replace(state.snapshot());
                keep_running
            });

            match tick.await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    error!("Tick for session {} did not complete: {}", session, e);
                    let mut state = self.state.lock().await;
                    if state.scheduler.session() == Some(session) {
                        state.stop_session();
                        state.last_error = Some(DriverError::EngineStepFailed(format!("tick aborted: {}", e)));
                        self.snapshots.send_replace(state.snapshot());
                    }
                    break;
                }
            }
        }

        debug!("Frame loop for session {} exited", self.session);
    }
}
