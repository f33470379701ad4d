// src/utils/errors.rs
//! Driver error taxonomy
//!
//! Every failure is reported to the caller of the operation that triggered
//! it (setup, reset, parameter change, or tick). Nothing here is retried
//! automatically; retries are always an explicit user action.

use thiserror::Error;

/// Result alias used throughout the driver
pub type Result<T> = std::result::Result<T, DriverError>;

/// Errors surfaced by the execution driver
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverError {
    /// Isolation precondition not met; permanent until the host reloads
    #[error("isolation precondition not met; parallel execution is unavailable")]
    IsolationUnavailable,

    /// Worker pool could not be created (never retried)
    #[error("worker pool initialization failed: {0}")]
    PoolInitFailed(String),

    /// Engine construction failed during setup or recreation
    #[error("engine creation failed: {0}")]
    EngineCreateFailed(String),

    /// Engine step or read-back violated its contract; the run was aborted
    #[error("engine step failed: {0}")]
    EngineStepFailed(String),

    /// Target image could not be loaded
    #[error("target image load failed: {0}")]
    ImageLoadFailed(String),

    /// Command issued before the driver was ready for it
    #[error("driver not ready: {0}")]
    NotReady(String),

    /// Invalid configuration or parameter value
    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl DriverError {
    /// Whether the error leaves the driver permanently unusable
    pub fn is_fatal(&self) -> bool {
        matches!(self, DriverError::IsolationUnavailable | DriverError::PoolInitFailed(_))
    }
}

impl From<config::ConfigError> for DriverError {
    fn from(err: config::ConfigError) -> Self {
        DriverError::ConfigError(err.to_string())
    }
}
