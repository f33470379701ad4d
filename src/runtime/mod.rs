// src/runtime/mod.rs
//! Engine execution runtime
//!
//! This module drives an external evolution engine at interactive rates:
//!
//! - **Isolation**: One-shot precondition check for parallel execution
//! - **Parallel Pool**: Exactly-once worker pool initialization
//! - **Engine**: Stepping and construction contracts of the engine
//! - **Lifecycle**: Ownership and token-serialized recreation of the engine
//! - **Scheduler**: Frame-paced batching, read-back and housekeeping
//! - **Throughput**: Generations-per-second measurement
//! - **Benchmark**: Time-to-threshold measurement
//! - **Driver**: Command facade, frame loop and snapshot publishing
//!
//! # Architecture
//!
//! ```text
//!   commands ──► Driver ──────────────────────────► watch<DriverSnapshot>
//!                  │
//!        ┌─────────┼──────────────┐
//!        ▼         ▼              ▼
//!   IsolationGate  ParallelismGate  EngineLifecycleManager ◄── EngineFactory
//!                                     ▲
//!                 frame loop ──► StepScheduler ──► ThroughputMeter
//!                                     │
//!                                     └──────────► BenchmarkController
//! ```

pub mod benchmark;
pub mod driver;
pub mod engine;
pub mod isolation;
pub mod lifecycle;
pub mod parallel_pool;
pub mod scheduler;
pub mod throughput;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use benchmark::{BenchmarkController, BenchmarkOutcome, BenchmarkResult};
pub use driver::{Driver, DriverDeps, DriverSnapshot, Readiness};
pub use engine::{EngineFactory, EvolutionEngine, StepParams};
pub use isolation::{IsolationGate, IsolationSource};
pub use lifecycle::{EngineLifecycleManager, EngineParams, HandleId, InstallOutcome, ReadBack, RecreateToken};
pub use parallel_pool::{ParallelContext, ParallelismGate, PoolBackend, RayonPoolBackend};
pub use scheduler::{FitnessHistory, FitnessSample, LoopSettings, SessionId, StepScheduler, TickContext, TickReport};
pub use throughput::ThroughputMeter;
