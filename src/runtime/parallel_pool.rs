// src/runtime/parallel_pool.rs
//! One-shot worker pool initialization
//!
//! The engine may fan a generation out across a worker pool. That pool is
//! process-wide and can be built exactly once, so the gate records the
//! outcome of the single attempt and hands the same outcome to every caller.
//!
//! # Lifecycle
//!
//! ```text
//! NotInitialized ──ensure_initialized()──► Initializing ──ok──► Initialized(workers)
//!                                               │
//!                                               └──err──► Failed (sticky, never retried)
//! ```
//!
//! The attempt runs on the blocking pool and does not belong to any caller,
//! so a caller that stops waiting (timeout, `select!`, aborted task) leaves
//! it running. Every caller, including later ones, awaits the same outcome.
//! Readers only ever observe "not initialized" or a final outcome.

use crate::utils::errors::{DriverError, Result};
use once_cell::sync::OnceCell as GlobalCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Default upper bound on pool workers
pub const DEFAULT_MAX_WORKERS: usize = 8;

static GLOBAL_GATE: GlobalCell<Arc<ParallelismGate>> = GlobalCell::new();

type PoolOutcome = std::result::Result<ParallelContext, String>;

/// Creates the underlying worker pool
pub trait PoolBackend: Send + Sync {
    /// Build a pool with `worker_count` workers; called at most once per gate
    fn init_pool(&self, worker_count: usize) -> anyhow::Result<()>;
}

/// Configures rayon's global thread pool
#[derive(Debug, Default, Clone, Copy)]
pub struct RayonPoolBackend;

impl PoolBackend for RayonPoolBackend {
    fn init_pool(&self, worker_count: usize) -> anyhow::Result<()> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(worker_count)
            .thread_name(|i| format!("evolve-worker-{i}"))
            .build_global()?;
        Ok(())
    }
}

/// Initialized pool parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelContext {
    pub worker_count: usize,
}

/// Collapses concurrent initialization requests onto one attempt
pub struct ParallelismGate {
    backend: Arc<dyn PoolBackend>,
    max_workers: usize,
    started: AtomicBool,
    outcome: Arc<watch::Sender<Option<PoolOutcome>>>,
    attempts: AtomicUsize,
}

impl ParallelismGate {
    /// Create an independent gate (tests, embedding)
    pub fn new(backend: Arc<dyn PoolBackend>, max_workers: usize) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            backend,
            max_workers: max_workers.max(1),
            started: AtomicBool::new(false),
            outcome: Arc::new(outcome),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Process-wide gate; the first caller's backend and bound win
    pub fn global_or_init<F>(init: F) -> Arc<ParallelismGate>
    where
        F: FnOnce() -> ParallelismGate,
    {
        Arc::clone(GLOBAL_GATE.get_or_init(|| Arc::new(init())))
    }

    /// Workers to request: hardware concurrency capped at the configured bound
    pub fn worker_count(&self) -> usize {
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        available.min(self.max_workers).max(1)
    }

    /// Initialize the pool, or await / return the outcome of the one attempt
    pub async fn ensure_initialized(&self) -> Result<ParallelContext> {
        let mut outcome_rx = self.outcome.subscribe();

        if !self.started.swap(true, Ordering::SeqCst) {
            self.spawn_attempt();
        }

        let outcome = outcome_rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| DriverError::PoolInitFailed("initialization outcome lost".into()))?
            .clone();

        debug!("Worker pool outcome observed: {:?}", outcome);
        match outcome {
            Some(outcome) => outcome.map_err(DriverError::PoolInitFailed),
            None => Err(DriverError::PoolInitFailed("initialization outcome lost".into())),
        }
    }

    /// Run the single attempt on the blocking pool and publish its outcome
    fn spawn_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let worker_count = self.worker_count();
        info!("Initializing worker pool with {} workers", worker_count);

        let backend = Arc::clone(&self.backend);
        let outcome = Arc::clone(&self.outcome);
        tokio::task::spawn_blocking(move || {
            let result = match catch_unwind(AssertUnwindSafe(|| backend.init_pool(worker_count))) {
                Ok(Ok(())) => {
                    info!("Worker pool initialized with {} workers", worker_count);
                    Ok(ParallelContext { worker_count })
                }
                Ok(Err(e)) => {
                    warn!("Worker pool initialization failed: {:#}", e);
                    Err(format!("{:#}", e))
                }
                Err(_) => {
                    warn!("Worker pool initialization panicked");
                    Err("initialization panicked".to_string())
                }
            };
            outcome.send_replace(Some(result));
        });
    }

/// Initialized context, if the attempt succeeded
    pub fn context(&self) -> Option<ParallelContext> {
        self.outcome
            .borrow()
            .as_ref()
            .and_then(|outcome| outcome.as_ref().ok().copied())
    }

    pub fn is_initialized(&self) -> bool {
        self.context().is_some()
    }

    /// Number of backend initialization attempts (0 or 1)
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ParallelismGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelismGate")
            .field("max_workers", &self.max_workers)
            .field("outcome", &*self.outcome.borrow())
            .field("attempts", &self.attempts())
            .finish()
    }
}
