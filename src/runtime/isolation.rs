// src/runtime/isolation.rs
//! Isolation precondition for parallel execution
//!
//! Shared-memory worker pools may only be created when the host runs in an
//! isolated context. The check runs once at setup; a failed check blocks
//! the pool, the engine, and the scheduler until the host is reloaded with
//! the precondition satisfied. There is no in-process recovery.

use crate::utils::config::IsolationConfig;
use crate::utils::errors::{DriverError, Result};
use tracing::{debug, warn};

/// Where the precondition value comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsolationSource {
    /// Fixed value supplied by the host
    Assumed(bool),

    /// Truthy environment flag (`1`, `true`, `yes`, `on`)
    EnvFlag(String),

    /// Precondition not enforced
    Disabled,
}

/// One-shot isolation check
#[derive(Debug, Clone)]
pub struct IsolationGate {
    source: IsolationSource,
}

impl IsolationGate {
    pub fn new(source: IsolationSource) -> Self {
        Self { source }
    }

    /// Build the gate from configuration
    pub fn from_config(config: &IsolationConfig) -> Self {
        let source = if !config.required {
            IsolationSource::Disabled
        } else if config.assume_isolated {
            IsolationSource::Assumed(true)
        } else {
            IsolationSource::EnvFlag(config.env_var.clone())
        };

        Self::new(source)
    }

    pub fn source(&self) -> &IsolationSource {
        &self.source
    }

    /// Evaluate the precondition
    pub fn is_isolated(&self) -> bool {
        match &self.source {
            IsolationSource::Assumed(value) => *value,
            IsolationSource::EnvFlag(name) => std::env::var(name)
                .map(|value| is_truthy(&value))
                .unwrap_or(false),
            IsolationSource::Disabled => true,
        }
    }

    /// Fail with `IsolationUnavailable` unless the precondition holds
    pub fn check(&self) -> Result<()> {
        debug!("Checking isolation precondition ({:?})", self.source);

        if self.is_isolated() {
            Ok(())
        } else {
            warn!("Isolation precondition not met ({:?}); reload the host to retry", self.source);
            Err(DriverError::IsolationUnavailable)
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assumed_values() {
        assert!(IsolationGate::new(IsolationSource::Assumed(true)).check().is_ok());
        assert_eq!(
            IsolationGate::new(IsolationSource::Assumed(false)).check(),
            Err(DriverError::IsolationUnavailable)
        );
    }

    #[test]
    fn test_disabled_always_passes() {
        assert!(IsolationGate::new(IsolationSource::Disabled).check().is_ok());
    }

    #[test]
    fn test_env_flag() {
        let name = "PIXEL_DRIVER_TEST_ISOLATION_FLAG";
        let gate = IsolationGate::new(IsolationSource::EnvFlag(name.to_string()));

        std::env::remove_var(name);
        assert!(gate.check().is_err());

        std::env::set_var(name, "TRUE");
        assert!(gate.check().is_ok());

        std::env::set_var(name, "0");
        assert!(gate.check().is_err());

        std::env::remove_var(name);
    }

    #[test]
    fn test_from_config() {
        let mut config = IsolationConfig::default();
        assert_eq!(
            IsolationGate::from_config(&config).source(),
            &IsolationSource::EnvFlag("CROSS_ORIGIN_ISOLATED".to_string())
        );

        config.assume_isolated = true;
        assert_eq!(IsolationGate::from_config(&config).source(), &IsolationSource::Assumed(true));

        config.required = false;
        assert_eq!(IsolationGate::from_config(&config).source(), &IsolationSource::Disabled);
    }

    #[test]
    fn test_truthy_values() {
        for value in ["1", "true", "Yes", " on "] {
            assert!(is_truthy(value), "{value} should be truthy");
        }
        for value in ["", "0", "false", "off", "maybe"] {
            assert!(!is_truthy(value), "{value} should not be truthy");
        }
    }
}
