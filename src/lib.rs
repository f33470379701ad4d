// src/lib.rs
//! Pixel Evolution Driver Library
//!
//! Drives a genetic-algorithm engine that evolves pixel grids toward a
//! target image: one-shot parallel setup, frame-paced batched stepping,
//! throughput measurement and a time-to-threshold benchmark.
//!
//! # Architecture
//!
//! The driver is structured into several key modules:
//!
//! - **runtime**: Isolation, worker pool, engine lifecycle, scheduler, driver facade
//! - **imaging**: Target image decoding and resizing
//! - **reference**: Island-model engine used by the binary and benches
//! - **observability**: Tracing and metrics setup
//! - **utils**: Configuration and errors

// Public module exports
pub mod imaging;
pub mod observability;
pub mod reference;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use imaging::{FileImageSource, ImageSource};
pub use runtime::driver::{Driver, DriverDeps, DriverSnapshot, Readiness};
pub use runtime::engine::{EngineFactory, EvolutionEngine, StepParams};
pub use utils::config::DriverConfig;
pub use utils::errors::{DriverError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
