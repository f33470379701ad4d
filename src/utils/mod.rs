// src/utils/mod.rs
//! Common utilities shared across the driver
//!
//! - **config**: Layered configuration loading and validation
//! - **errors**: Driver error taxonomy and result alias

pub mod config;
pub mod errors;

pub use config::DriverConfig;
pub use errors::{DriverError, Result};
