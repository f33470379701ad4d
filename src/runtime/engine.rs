// src/runtime/engine.rs
//! Stepping contract of the external evolution engine
//!
//! The engine owns its population and operators; the driver only creates
//! instances, advances them, and reads results back through these traits.

/// Per-step parameters forwarded to the engine
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepParams {
    /// Base mutation rate (0.001-0.1)
    pub mutation_rate: f64,

    /// Let the engine scale the rate by current fitness
    pub auto_mutation: bool,

    /// Let the engine use the worker pool
    pub parallel: bool,
}

impl Default for StepParams {
    fn default() -> Self {
        Self {
            mutation_rate: 0.01,
            auto_mutation: false,
            parallel: false,
        }
    }
}

/// An engine instance evolving a population toward a target image
pub trait EvolutionEngine: Send {
    /// Advance one generation
    fn step(&mut self, params: &StepParams) -> anyhow::Result<()>;

    /// Advance exactly `count` generations (`count >= 1`) in one call
    fn step_batch(&mut self, count: u32, params: &StepParams) -> anyhow::Result<()> {
        for _ in 0..count {
            self.step(params)?;
        }
        Ok(())
    }

    /// Generations advanced since creation
    fn generation(&self) -> u64;

    /// Best fitness in [0, 1]
    fn best_fitness(&self) -> f64;

    /// Best candidate as row-major RGBA, `grid_dimension² × 4` bytes
    fn best_image(&self) -> Vec<u8>;
}

/// Builds engine instances
pub trait EngineFactory: Send + Sync {
    /// Create an engine for `target` (RGBA, `grid_dimension² × 4` bytes)
    fn create(
        &self,
        target: &[u8],
        population_size: usize,
        grid_dimension: u32,
    ) -> anyhow::Result<Box<dyn EvolutionEngine>>;
}

/// Byte length of an RGBA grid
pub fn rgba_len(grid_dimension: u32) -> usize {
    let side = grid_dimension as usize;
    side * side * 4
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        generation: u64,
    }

    impl EvolutionEngine for Counter {
        fn step(&mut self, _params: &StepParams) -> anyhow::Result<()> {
            self.generation += 1;
            Ok(())
        }

        fn generation(&self) -> u64 {
            self.generation
        }

        fn best_fitness(&self) -> f64 {
            0.0
        }

        fn best_image(&self) -> Vec<u8> {
            Vec::new()
        }
    }

    #[test]
    fn test_default_step_batch_advances_count() {
        let mut engine = Counter { generation: 0 };
        engine.step_batch(25, &StepParams::default()).unwrap();
        assert_eq!(engine.generation(), 25);
    }

    #[test]
    fn test_rgba_len() {
        assert_eq!(rgba_len(32), 4096);
        assert_eq!(rgba_len(128), 65_536);
    }
}
