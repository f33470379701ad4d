// src/runtime/lifecycle.rs
//! Engine lifecycle management
//!
//! Owns the single current engine instance. Every recreation (reset,
//! population change, grid change) goes through a [`RecreateToken`]: the
//! slow part (image load, engine construction) runs without holding the
//! manager, and only the result of the latest request is installed. Older
//! results are dropped on arrival.
//!
//! Installing a handle drops the previous one explicitly, so an engine that
//! holds external resources is released at the moment it stops being
//! current rather than whenever the last reference happens to go away.

use crate::runtime::engine::{rgba_len, EngineFactory, EvolutionEngine, StepParams};
use crate::utils::errors::{DriverError, Result};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Identity of an installed engine instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandleId(pub u64);

/// Ticket for one recreation request; only the latest one may install
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RecreateToken(u64);

/// Parameters an engine instance was created with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineParams {
    pub population_size: usize,
    pub grid_dimension: u32,
}

/// Exclusively owned engine instance
pub struct EngineHandle {
    id: HandleId,
    params: EngineParams,
    engine: Box<dyn EvolutionEngine>,
    created_at: Instant,
}

impl EngineHandle {
    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn params(&self) -> EngineParams {
        self.params
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        debug!(
            "Releasing engine {:?} after {:?} at generation {}",
            self.id,
            self.created_at.elapsed(),
            self.engine.generation()
        );
    }
}

/// State read back from the engine after a tick
#[derive(Debug, Clone, PartialEq)]
pub struct ReadBack {
    pub generation: u64,
    pub fitness: f64,

    /// Present only when requested
    pub best_image: Option<Bytes>,
}

/// Result of an install attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed(HandleId),

    /// A newer request was issued while this engine was being built
    Superseded,
}

/// Owner of the current engine instance
pub struct EngineLifecycleManager {
    factory: Arc<dyn EngineFactory>,
    current: Option<EngineHandle>,
    next_handle: u64,
    latest_request: u64,
    installed_total: u64,
}

impl EngineLifecycleManager {
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            factory,
            current: None,
            next_handle: 0,
            latest_request: 0,
            installed_total: 0,
        }
    }

    pub fn factory(&self) -> Arc<dyn EngineFactory> {
        Arc::clone(&self.factory)
    }

    /// Issue a token for a new recreation request, invalidating older ones
    pub fn begin_recreate(&mut self) -> RecreateToken {
        self.latest_request += 1;
        RecreateToken(self.latest_request)
    }

    pub fn is_latest(&self, token: RecreateToken) -> bool {
        token.0 == self.latest_request
    }

    /// Construct an engine without touching the manager
    pub fn build(
        factory: &dyn EngineFactory,
        target: &[u8],
        params: EngineParams,
    ) -> Result<Box<dyn EvolutionEngine>> {
        let expected = rgba_len(params.grid_dimension);
        if target.len() != expected {
            return Err(DriverError::EngineCreateFailed(format!(
                "target is {} bytes, expected {} for a {}x{} grid",
                target.len(),
                expected,
                params.grid_dimension,
                params.grid_dimension
            )));
        }

        factory
            .create(target, params.population_size, params.grid_dimension)
            .map_err(|e| DriverError::EngineCreateFailed(format!("{:#}", e)))
    }

    /// Install a freshly built engine if `token` is still the latest request
    ///
    /// The caller must have stopped the scheduler first.
    pub fn install(
        &mut self,
        token: RecreateToken,
        params: EngineParams,
        engine: Box<dyn EvolutionEngine>,
    ) -> InstallOutcome {
        if !self.is_latest(token) {
            debug!("Discarding engine for superseded request {:?}", token);
            return InstallOutcome::Superseded;
        }

        self.next_handle += 1;
        let id = HandleId(self.next_handle);

        // drop the old instance before the new one becomes current
        if let Some(previous) = self.current.take() {
            info!("Replacing engine {:?} with {:?}", previous.id, id);
            drop(previous);
        }

        self.current = Some(EngineHandle {
            id,
            params,
            engine,
            created_at: Instant::now(),
        });
        self.installed_total += 1;

        info!(
            "Engine {:?} installed (population {}, grid {}x{})",
            id, params.population_size, params.grid_dimension, params.grid_dimension
        );
        InstallOutcome::Installed(id)
    }

    /// Build and install in one call, replacing any current engine
    pub fn create(
        &mut self,
        target: &[u8],
        population_size: usize,
        grid_dimension: u32,
    ) -> Result<HandleId> {
        let token = self.begin_recreate();
        let params = EngineParams {
            population_size,
            grid_dimension,
        };
        let engine = Self::build(self.factory.as_ref(), target, params)?;

        match self.install(token, params, engine) {
            InstallOutcome::Installed(id) => Ok(id),
            InstallOutcome::Superseded => unreachable!("token issued under &mut self is always latest"),
        }
    }

    /// Drop the current engine, if any
    pub fn release(&mut self) {
        if let Some(handle) = self.current.take() {
            info!("Engine {:?} released", handle.id);
        }
    }

    pub fn has_engine(&self) -> bool {
        self.current.is_some()
    }

    pub fn current_id(&self) -> Option<HandleId> {
        self.current.as_ref().map(EngineHandle::id)
    }

    pub fn current_params(&self) -> Option<EngineParams> {
        self.current.as_ref().map(EngineHandle::params)
    }

    /// Engines installed over the manager's lifetime
    pub fn installed_total(&self) -> u64 {
        self.installed_total
    }

    /// Advance the current engine by `batch_size` generations
    pub fn step(&mut self, batch_size: u32, params: &StepParams) -> Result<()> {
        let handle = self
            .current
            .as_mut()
            .ok_or_else(|| DriverError::NotReady("no engine installed".into()))?;

        let result = if batch_size <= 1 {
            handle.engine.step(params)
        } else {
            handle.engine.step_batch(batch_size, params)
        };

        result.map_err(|e| DriverError::EngineStepFailed(format!("{:#}", e)))
    }

    /// Read generation, fitness, and optionally the best image
    pub fn read_back(&self, include_image: bool) -> Result<ReadBack> {
        let handle = self
            .current
            .as_ref()
            .ok_or_else(|| DriverError::NotReady("no engine installed".into()))?;

        let generation = handle.engine.generation();
        let fitness = handle.engine.best_fitness();
        if !(0.0..=1.0).contains(&fitness) {
            return Err(DriverError::EngineStepFailed(format!(
                "fitness {} outside [0, 1]",
                fitness
            )));
        }

        let best_image = if include_image {
            let image = handle.engine.best_image();
            let expected = rgba_len(handle.params.grid_dimension);
            if image.len() != expected {
                return Err(DriverError::EngineStepFailed(format!(
                    "best image is {} bytes, expected {}",
                    image.len(),
                    expected
                )));
            }
            Some(Bytes::from(image))
        } else {
            None
        };

        Ok(ReadBack {
            generation,
            fitness,
            best_image,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::{ScriptedEngineFactory, ScriptedSpec};

    fn manager() -> (EngineLifecycleManager, Arc<ScriptedEngineFactory>) {
        let factory = Arc::new(ScriptedEngineFactory::new(ScriptedSpec::linear(0.001)));
        (EngineLifecycleManager::new(factory.clone()), factory)
    }

    #[test]
    fn test_create_and_read_back() {
        let (mut lifecycle, _) = manager();
        let id = lifecycle.create(&vec![0u8; 4096], 100, 32).unwrap();

        assert_eq!(lifecycle.current_id(), Some(id));
        let state = lifecycle.read_back(true).unwrap();
        assert_eq!(state.generation, 0);
        assert_eq!(state.best_image.unwrap().len(), 4096);

        let state = lifecycle.read_back(false).unwrap();
        assert!(state.best_image.is_none());
    }

    #[test]
    fn test_create_replaces_and_releases_previous() {
        let (mut lifecycle, factory) = manager();
        let first = lifecycle.create(&vec![0u8; 4096], 100, 32).unwrap();
        lifecycle.step(5, &StepParams::default()).unwrap();

        let second = lifecycle.create(&vec![0u8; 16_384], 200, 64).unwrap();
        assert!(second > first);
        assert_eq!(factory.live_engines(), 1);
        assert_eq!(lifecycle.read_back(false).unwrap().generation, 0);
        assert_eq!(
            lifecycle.current_params(),
            Some(EngineParams { population_size: 200, grid_dimension: 64 })
        );
    }

    #[test]
    fn test_stale_token_is_discarded() {
        let (mut lifecycle, factory) = manager();
        let params = EngineParams { population_size: 100, grid_dimension: 32 };
        let target = vec![0u8; 4096];

        let older = lifecycle.begin_recreate();
        let newer = lifecycle.begin_recreate();

        let newer_engine = EngineLifecycleManager::build(factory.as_ref(), &target, params).unwrap();
        assert!(matches!(lifecycle.install(newer, params, newer_engine), InstallOutcome::Installed(_)));
        let installed = lifecycle.current_id();

        let older_engine = EngineLifecycleManager::build(factory.as_ref(), &target, params).unwrap();
        assert_eq!(lifecycle.install(older, params, older_engine), InstallOutcome::Superseded);
        assert_eq!(lifecycle.current_id(), installed);
        assert_eq!(factory.live_engines(), 1);
    }

    #[test]
    fn test_target_length_mismatch_fails_creation() {
        let (mut lifecycle, factory) = manager();
        let result = lifecycle.create(&vec![0u8; 100], 100, 32);
        assert!(matches!(result, Err(DriverError::EngineCreateFailed(_))));
        assert!(!lifecycle.has_engine());
        assert_eq!(factory.created(), 0);
    }

    #[test]
    fn test_factory_failure_maps_to_create_failed() {
        let factory = Arc::new(ScriptedEngineFactory::failing("out of memory"));
        let mut lifecycle = EngineLifecycleManager::new(factory);
        let result = lifecycle.create(&vec![0u8; 4096], 100, 32);
        assert!(matches!(result, Err(DriverError::EngineCreateFailed(ref msg)) if msg.contains("out of memory")));
    }

    #[test]
    fn test_batch_dispatch() {
        let (mut lifecycle, factory) = manager();
        lifecycle.create(&vec![0u8; 4096], 100, 32).unwrap();

        lifecycle.step(1, &StepParams::default()).unwrap();
        lifecycle.step(10, &StepParams::default()).unwrap();

        assert_eq!(factory.single_steps(), 1);
        assert_eq!(factory.batch_calls(), vec![10]);
        assert_eq!(lifecycle.read_back(false).unwrap().generation, 11);
    }

    #[test]
    fn test_contract_violations() {
        let factory = Arc::new(ScriptedEngineFactory::new(ScriptedSpec::linear(0.0).with_fitness_override(1.5)));
        let mut lifecycle = EngineLifecycleManager::new(factory);
        lifecycle.create(&vec![0u8; 4096], 100, 32).unwrap();
        assert!(matches!(lifecycle.read_back(false), Err(DriverError::EngineStepFailed(_))));

        let factory = Arc::new(ScriptedEngineFactory::new(ScriptedSpec::linear(0.0).with_image_len(10)));
        let mut lifecycle = EngineLifecycleManager::new(factory);
        lifecycle.create(&vec![0u8; 4096], 100, 32).unwrap();
        assert!(lifecycle.read_back(false).is_ok());
        assert!(matches!(lifecycle.read_back(true), Err(DriverError::EngineStepFailed(_))));
    }

    #[test]
    fn test_step_without_engine() {
        let (mut lifecycle, _) = manager();
        assert!(matches!(
            lifecycle.step(1, &StepParams::default()),
            Err(DriverError::NotReady(_))
        ));
    }
}
