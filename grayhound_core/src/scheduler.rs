use crate::corpus::{Corpus, Seed};
use crate::coverage::PathId;
use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;
use rand_core::RngCore;
use std::collections::HashMap;
use thiserror::Error;

/// Exponent of the AFLFast schedule used when none is configured.
pub const DEFAULT_AFLFAST_EXPONENT: f64 = 5.0;
/// Largest decay cap; `2^1023` is the largest power of two an `f64` holds.
pub const MAX_DECAY_CAP: u32 = 1023;

/// Errors that can occur during scheduler operations.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// Indicates that the population is empty, and therefore no seed can be scheduled.
    #[error("Corpus is empty, cannot schedule next input")]
    CorpusEmpty,
    /// A schedule was configured with a parameter that would make energy zero,
    /// negative or undefined.
    #[error("Invalid schedule parameter: {0}")]
    InvalidParameter(String),
}

/// How many executions have exercised each path so far.
#[derive(Debug, Clone, Default)]
pub struct PathFrequency {
    counts: HashMap<PathId, u64>,
    total: u64,
}

impl PathFrequency {
    /// Counts one more execution of `path` and returns its new frequency.
    pub fn record(&mut self, path: PathId) -> u64 {
        self.total += 1;
        let count = self.counts.entry(path).or_insert(0);
        *count += 1;
        *count
    }

    pub fn get(&self, path: &PathId) -> u64 {
        self.counts.get(path).copied().unwrap_or(0)
    }

    /// Number of distinct paths seen.
    pub fn distinct(&self) -> usize {
        self.counts.len()
    }

    /// Number of recorded executions.
    pub fn total(&self) -> u64 {
        self.total
    }
}

fn positive_energy(energy: f64) -> f64 {
    if energy.is_nan() || energy <= 0.0 {
        f64::MIN_POSITIVE
    } else {
        energy.clamp(f64::MIN_POSITIVE, f64::MAX)
    }
}

/// Maps a seed to its energy, i.e. its relative weight when the next seed
/// to fuzz is drawn.
pub trait PowerSchedule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Computes the energy of one seed.
    ///
    /// # Arguments
    /// * `seed`: The seed to weigh, including its `fuzzed_count` and path.
    /// * `path_frequency`: How often each path has been exercised so far.
    ///
    /// # Returns
    /// The seed's selection weight. Built-in schedules always return a
    /// finite value > 0; the `Scheduler` treats anything else as 0.
    fn energy(&self, seed: &Seed, path_frequency: &PathFrequency) -> f64;
}

/// Every seed gets the same energy.
#[derive(Debug, Default, Clone, Copy)]
pub struct UniformSchedule;

impl PowerSchedule for UniformSchedule {
    fn name(&self) -> &'static str {
        "uniform"
    }

    fn energy(&self, _seed: &Seed, _path_frequency: &PathFrequency) -> f64 {
        1.0
    }
}

/// AFLFast's exponential schedule: `1 / freq(path)^exponent`, so seeds on
/// rarely exercised paths are drawn far more often.
#[derive(Debug, Clone, Copy)]
pub struct AflFastSchedule {
    exponent: f64,
}

impl AflFastSchedule {
    pub fn new(exponent: f64) -> Result<Self, SchedulerError> {
        if !exponent.is_finite() || exponent < 0.0 {
            return Err(SchedulerError::InvalidParameter(format!(
                "AFLFast exponent must be finite and >= 0, got {exponent}"
            )));
        }
        Ok(Self { exponent })
    }

    pub fn exponent(&self) -> f64 {
        self.exponent
    }
}

impl Default for AflFastSchedule {
    fn default() -> Self {
        Self {
            exponent: DEFAULT_AFLFAST_EXPONENT,
        }
    }
}

impl PowerSchedule for AflFastSchedule {
    fn name(&self) -> &'static str {
        "afl-fast"
    }

    fn energy(&self, seed: &Seed, path_frequency: &PathFrequency) -> f64 {
        let frequency = path_frequency.get(&seed.path_id).max(1) as f64;
        positive_energy(1.0 / frequency.powf(self.exponent))
    }
}

/// Halves a seed's energy each time it is picked, down to
/// `base / 2^cap`.
#[derive(Debug, Clone, Copy)]
pub struct DecaySchedule {
    base: f64,
    cap: u32,
}

impl DecaySchedule {
    pub fn new(base: f64, cap: u32) -> Result<Self, SchedulerError> {
        if !base.is_finite() || base <= 0.0 {
            return Err(SchedulerError::InvalidParameter(format!(
                "decay base must be finite and > 0, got {base}"
            )));
        }
        if cap > MAX_DECAY_CAP {
            return Err(SchedulerError::InvalidParameter(format!(
                "decay cap must be <= {MAX_DECAY_CAP}, got {cap}"
            )));
        }
        Ok(Self { base, cap })
    }

    /// Energy of a seed that has been fuzzed `fuzzed_count` times.
    pub fn energy_for(&self, fuzzed_count: u64) -> f64 {
        let exponent = fuzzed_count.min(u64::from(self.cap)) as i32;
        positive_energy(self.base / 2f64.powi(exponent))
    }
}

impl PowerSchedule for DecaySchedule {
    fn name(&self) -> &'static str {
        "decay"
    }

    fn energy(&self, seed: &Seed, _path_frequency: &PathFrequency) -> f64 {
        self.energy_for(seed.fuzzed_count)
    }
}

/// Picks the next seed to fuzz and keeps the bookkeeping the power schedule
/// feeds on.
///
/// Selection is weighted by energy. If the weights cannot be used (all zero
/// or not finite) the scheduler walks the population round-robin in
/// insertion order instead.
pub struct Scheduler {
    schedule: Box<dyn PowerSchedule>,
    path_frequency: PathFrequency,
    next_round_robin: usize,
}

impl Scheduler {
    pub fn new(schedule: Box<dyn PowerSchedule>) -> Self {
        Self {
            schedule,
            path_frequency: PathFrequency::default(),
            next_round_robin: 0,
        }
    }

    pub fn schedule_name(&self) -> &'static str {
        self.schedule.name()
    }

    pub fn path_frequency(&self) -> &PathFrequency {
        &self.path_frequency
    }

    /// Counts an execution that exercised `path`.
    pub fn record_path(&mut self, path: PathId) -> u64 {
        self.path_frequency.record(path)
    }

    /// Recomputes the energy of every seed.
    pub fn assign_energy(&self, corpus: &mut dyn Corpus) {
        for seed in corpus.seeds_mut() {
            seed.energy = self.schedule.energy(seed, &self.path_frequency);
        }
    }

    /// Selects the ID of the next seed to mutate.
    ///
    /// # Arguments
    /// * `corpus`: The population. It is mutable because every seed's
    ///   `energy` is refreshed before drawing.
    /// * `rng`: The run's random stream, used for the weighted draw.
    ///
    /// # Returns
    /// The ID of the selected seed, or `SchedulerError::CorpusEmpty` if the
    /// population has no seeds.
    pub fn choose(
        &mut self,
        corpus: &mut dyn Corpus,
        rng: &mut dyn RngCore,
    ) -> Result<usize, SchedulerError> {
        if corpus.is_empty() {
            return Err(SchedulerError::CorpusEmpty);
        }
        self.assign_energy(corpus);

        let weights = corpus.seeds().iter().map(|seed| {
            if seed.energy.is_finite() && seed.energy > 0.0 {
                seed.energy
            } else {
                0.0
            }
        });
        match WeightedIndex::new(weights) {
            Ok(distribution) => Ok(distribution.sample(rng)),
            Err(e) => {
                let id = self.next_round_robin % corpus.len();
                self.next_round_robin = id + 1;
                log::debug!("Energy weights unusable ({e}), falling back to round-robin seed {id}");
                Ok(id)
            }
        }
    }

    /// Bookkeeping after `seed` was mutated and the child executed.
    ///
    /// The parent's selection counter always advances; the child's path is
    /// counted whether or not the child joins the population.
    pub fn update(&mut self, seed: &mut Seed, produced_path: PathId, failed: bool) {
        seed.fuzzed_count += 1;
        if failed {
            seed.failing_children += 1;
        }
        self.path_frequency.record(produced_path);
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("schedule", &self.schedule.name())
            .field("paths", &self.path_frequency.distinct())
            .field("next_round_robin", &self.next_round_robin)
            .finish()
    }
}
