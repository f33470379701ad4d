// src/reference/mod.rs
//! Island-model reference engine
//!
//! A small genetic algorithm that evolves raw RGBA genomes toward the
//! target, used by the binary and the benches. Four islands evolve
//! independently (on the worker pool when `parallel` is set) and exchange
//! their elites around a ring every [`MIGRATION_INTERVAL`] generations.

use crate::runtime::engine::{rgba_len, EngineFactory, EvolutionEngine, StepParams};
use rand::Rng;
use rayon::prelude::*;
use std::cmp::Ordering;
use tracing::{debug, trace};

/// Islands per engine
pub const ISLAND_COUNT: usize = 4;

/// Generations between ring migrations
pub const MIGRATION_INTERVAL: u64 = 50;

/// Maximum per-channel change applied by one mutation
pub const MUTATION_NOISE: i16 = 10;

/// Base mutation rate scaled down as fitness approaches 1
pub fn effective_mutation_rate(best_fitness: f64, base_rate: f64, auto_mutation: bool) -> f64 {
    if !auto_mutation {
        return base_rate;
    }

    let factor = if best_fitness > 0.99 {
        0.3
    } else if best_fitness > 0.98 {
        0.5
    } else if best_fitness > 0.97 {
        0.7
    } else if best_fitness > 0.95 {
        0.8
    } else if best_fitness > 0.90 {
        0.9
    } else {
        1.0
    };
    base_rate * factor
}

/// `1 - SAD / (255 × len)` over all four channels
pub fn similarity(genome: &[u8], target: &[u8]) -> f64 {
    debug_assert_eq!(genome.len(), target.len());
    if genome.is_empty() {
        return 1.0;
    }

    let sad: u64 = genome
        .iter()
        .zip(target)
        .map(|(&a, &b)| a.abs_diff(b) as u64)
        .sum();
    1.0 - sad as f64 / (255.0 * genome.len() as f64)
}

#[derive(Debug, Clone)]
struct Individual {
    genome: Vec<u8>,
    fitness: f64,
}

impl Individual {
    fn random<R: Rng>(len: usize, target: &[u8], rng: &mut R) -> Self {
        let mut genome = vec![0u8; len];
        rng.fill(genome.as_mut_slice());
        let fitness = similarity(&genome, target);
        Self { genome, fitness }
    }

    /// Uniform crossover
    fn crossover<R: Rng>(&self, partner: &Individual, rng: &mut R) -> Vec<u8> {
        self.genome
            .iter()
            .zip(&partner.genome)
            .map(|(&a, &b)| if rng.gen_bool(0.5) { a } else { b })
            .collect()
    }
}

fn mutate<R: Rng>(genome: &mut [u8], rate: f64, rng: &mut R) {
    for channel in genome.iter_mut() {
        if rng.gen::<f64>() < rate {
            let noise = rng.gen_range(-MUTATION_NOISE..=MUTATION_NOISE);
            *channel = (*channel as i16 + noise).clamp(0, 255) as u8;
        }
    }
}

/// One isolated population, kept sorted best-first
#[derive(Debug, Clone)]
struct Island {
    individuals: Vec<Individual>,
}

impl Island {
    fn new<R: Rng>(size: usize, target: &[u8], rng: &mut R) -> Self {
        let mut island = Self {
            individuals: (0..size).map(|_| Individual::random(target.len(), target, rng)).collect(),
        };
        island.sort();
        island
    }

    fn sort(&mut self) {
        self.individuals
            .sort_by(|a, b| b.fitness.partial_cmp(&a.fitness).unwrap_or(Ordering::Equal));
    }

    fn best(&self) -> &Individual {
        &self.individuals[0]
    }

    /// Keep the elite, breed the rest from the top half
    fn evolve<R: Rng>(&mut self, target: &[u8], mutation_rate: f64, rng: &mut R) {
        let size = self.individuals.len();
        let parents = (size / 2).max(1);

        let mut next = Vec::with_capacity(size);
        next.push(self.individuals[0].clone());

        while next.len() < size {
            let a = &self.individuals[rng.gen_range(0..parents)];
            let b = &self.individuals[rng.gen_range(0..parents)];
            let mut genome = a.crossover(b, rng);
            mutate(&mut genome, mutation_rate, rng);
            let fitness = similarity(&genome, target);
            next.push(Individual { genome, fitness });
        }

        self.individuals = next;
        self.sort();
    }
}

/// Four-island genetic algorithm over raw RGBA genomes
pub struct IslandEngine {
    target: Vec<u8>,
    islands: Vec<Island>,
    generation: u64,
}

impl IslandEngine {
    pub fn new(target: &[u8], population_size: usize) -> Self {
        let per_island = (population_size / ISLAND_COUNT).max(2);
        let mut rng = rand::thread_rng();
        let islands = (0..ISLAND_COUNT)
            .map(|_| Island::new(per_island, target, &mut rng))
            .collect();

        Self {
            target: target.to_vec(),
            islands,
            generation: 0,
        }
    }

    fn best_island(&self) -> &Island {
        self.islands
            .iter()
            .max_by(|a, b| {
                a.best()
                    .fitness
                    .partial_cmp(&b.best().fitness)
                    .unwrap_or(Ordering::Equal)
            })
            .unwrap_or(&self.islands[0])
    }

    /// Copy every island's elite over the worst member of the next island
    fn migrate(&mut self) {
        let count = self.islands.len();
        if count < 2 {
            return;
        }

        let elites: Vec<Individual> = self.islands.iter().map(|island| island.best().clone()).collect();
        for (i, elite) in elites.into_iter().enumerate() {
            let island = &mut self.islands[(i + 1) % count];
            if let Some(worst) = island.individuals.last_mut() {
                *worst = elite;
            }
            island.sort();
        }
        trace!("Migrated elites at generation {}", self.generation);
    }
}

impl EvolutionEngine for IslandEngine {
    fn step(&mut self, params: &StepParams) -> anyhow::Result<()> {
        let rate = effective_mutation_rate(self.best_fitness(), params.mutation_rate, params.auto_mutation);
        let target = self.target.as_slice();

        if params.parallel {
            self.islands
                .par_iter_mut()
                .for_each(|island| island.evolve(target, rate, &mut rand::thread_rng()));
        } else {
            let mut rng = rand::thread_rng();
            for island in self.islands.iter_mut() {
                island.evolve(target, rate, &mut rng);
            }
        }

        self.generation += 1;
        if self.generation % MIGRATION_INTERVAL == 0 {
            self.migrate();
        }
        Ok(())
    }

    fn generation(&self) -> u64 {
        self.generation
    }

    fn best_fitness(&self) -> f64 {
        self.best_island().best().fitness.clamp(0.0, 1.0)
    }

    fn best_image(&self) -> Vec<u8> {
        self.best_island().best().genome.clone()
    }
}

/// Builds [`IslandEngine`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct IslandEngineFactory;

impl EngineFactory for IslandEngineFactory {
    fn create(
        &self,
        target: &[u8],
        population_size: usize,
        grid_dimension: u32,
    ) -> anyhow::Result<Box<dyn EvolutionEngine>> {
        anyhow::ensure!(
            target.len() == rgba_len(grid_dimension),
            "target is {} bytes, expected {}",
            target.len(),
            rgba_len(grid_dimension)
        );
        anyhow::ensure!(population_size >= ISLAND_COUNT, "population {} is too small", population_size);

        debug!(
            "Creating island engine: {} islands × {} individuals",
            ISLAND_COUNT,
            (population_size / ISLAND_COUNT).max(2)
        );
        Ok(Box::new(IslandEngine::new(target, population_size)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutation_schedule() {
        assert_eq!(effective_mutation_rate(0.99, 0.05, false), 0.05);
        assert_eq!(effective_mutation_rate(0.5, 0.1, true), 0.1);
        assert!((effective_mutation_rate(0.92, 0.1, true) - 0.09).abs() < 1e-10);
        assert!((effective_mutation_rate(0.96, 0.1, true) - 0.08).abs() < 1e-10);
        assert!((effective_mutation_rate(0.975, 0.1, true) - 0.07).abs() < 1e-10);
        assert!((effective_mutation_rate(0.985, 0.1, true) - 0.05).abs() < 1e-10);
        assert!((effective_mutation_rate(0.995, 0.1, true) - 0.03).abs() < 1e-10);
        // boundaries are exclusive
        assert_eq!(effective_mutation_rate(0.90, 0.1, true), 0.1);
    }

    #[test]
    fn test_similarity_bounds() {
        assert_eq!(similarity(&[0; 16], &[0; 16]), 1.0);
        assert_eq!(similarity(&[0; 16], &[255; 16]), 0.0);
        assert!((similarity(&[0, 0], &[255, 0]) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_mutation_changes_genome() {
        let mut genome = vec![128u8; 4096];
        mutate(&mut genome, 1.0, &mut rand::thread_rng());
        assert!(genome.iter().any(|&c| c != 128));
        assert!(genome.iter().all(|&c| (118..=138).contains(&c)));
    }

    #[test]
    fn test_crossover_mixes_parents() {
        let a = Individual { genome: vec![0; 4096], fitness: 0.0 };
        let b = Individual { genome: vec![255; 4096], fitness: 0.0 };
        let child = a.crossover(&b, &mut rand::thread_rng());

        assert_eq!(child.len(), 4096);
        assert!(child.contains(&0));
        assert!(child.contains(&255));
    }

    #[test]
    fn test_elitism_never_loses_best() {
        let target = vec![100u8; rgba_len(32)];
        let mut engine = IslandEngine::new(&target, 40);
        let params = StepParams { mutation_rate: 0.05, ..StepParams::default() };

        let mut previous = engine.best_fitness();
        for _ in 0..20 {
            engine.step(&params).unwrap();
            let current = engine.best_fitness();
            assert!(current >= previous);
            previous = current;
        }
        assert_eq!(engine.generation(), 20);
    }

    #[test]
    fn test_migration_moves_elites_around_ring() {
        let target = vec![0u8; 64];
        let mut engine = IslandEngine::new(&target, 16);
        let perfect = Individual { genome: vec![0; 64], fitness: 1.0 };
        engine.islands[0].individuals[0] = perfect;

        engine.migrate();
        assert_eq!(engine.islands[1].best().fitness, 1.0);
        assert_eq!(engine.islands[1].best().genome, vec![0; 64]);
    }

    #[test]
    fn test_parallel_step_advances() {
        let target = vec![50u8; rgba_len(32)];
        let mut engine = IslandEngine::new(&target, 20);
        let params = StepParams { mutation_rate: 0.01, auto_mutation: true, parallel: true };

        engine.step_batch(MIGRATION_INTERVAL as u32, &params).unwrap();
        assert_eq!(engine.generation(), MIGRATION_INTERVAL);
        assert_eq!(engine.best_image().len(), rgba_len(32));
        assert!((0.0..=1.0).contains(&engine.best_fitness()));
    }

    #[test]
    fn test_factory_validates_target() {
        let factory = IslandEngineFactory;
        assert!(factory.create(&[0u8; 100], 100, 32).is_err());
        assert!(factory.create(&vec![0u8; rgba_len(32)], 2, 32).is_err());

        let engine = factory.create(&vec![0u8; rgba_len(32)], 100, 32).unwrap();
        assert_eq!(engine.generation(), 0);
    }
}
