use crate::config::{ConfigError, GrayhoundConfig};
use crate::corpus::{Corpus, CorpusError, CorpusSource, InMemoryCorpus, Seed};
use crate::executor::{Executor, ExecutorError, SutFailure};
use crate::feedback::{CoverageFeedback, Feedback, FeedbackError};
use crate::input::MutationInput;
use crate::mutator::{MutationError, Mutator};
use crate::oracle::{FailureOracle, FailureReport};
use crate::scheduler::{Scheduler, SchedulerError};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Iterations between progress log lines unless configured otherwise.
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 10_000;

/// Faults that end a run. Target failures are not among them; those are
/// recorded and the loop carries on.
#[derive(Error, Debug)]
pub enum FuzzError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Scheduling failed: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("Mutation failed: {0}")]
    Mutation(#[from] MutationError),
    #[error("Execution failed: {0}")]
    Executor(#[from] ExecutorError),
    #[error("Population operation failed: {0}")]
    Corpus(#[from] CorpusError),
    #[error("Feedback failed: {0}")]
    Feedback(#[from] FeedbackError),
    #[error("Fuzzer is stopped")]
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuzzerState {
    Running,
    Stopped,
}

/// When `run` should stop. A budget with neither limit set never ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Budget {
    pub max_trials: Option<u64>,
    pub max_duration: Option<Duration>,
}

impl Budget {
    pub fn trials(max_trials: u64) -> Self {
        Self {
            max_trials: Some(max_trials),
            max_duration: None,
        }
    }

    pub fn duration(max_duration: Duration) -> Self {
        Self {
            max_trials: None,
            max_duration: Some(max_duration),
        }
    }

    pub fn exhausted(&self, trials: u64, elapsed: Duration) -> bool {
        self.max_trials.is_some_and(|max| trials >= max)
            || self.max_duration.is_some_and(|max| elapsed >= max)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FuzzStats {
    /// Main-loop iterations, excluding the baseline runs of the initial corpus.
    pub iterations: u64,
    /// All target executions, baseline runs included.
    pub executions: u64,
    /// Failing executions, duplicates included.
    pub failures: u64,
    pub unique_failures: usize,
    /// Total operator applications; with stacked policies this exceeds
    /// `iterations`.
    pub mutations_applied: u64,
    pub population: usize,
    pub distinct_signatures: usize,
    pub covered_grams: usize,
    pub elapsed: Duration,
}

/// What happened during one iteration.
#[derive(Debug, Clone)]
pub struct IterationReport {
    pub iteration: u64,
    /// ID of the seed that was mutated.
    pub parent: usize,
    pub candidate: String,
    pub applied: usize,
    /// ID of the seed created for the candidate, if its signature was novel.
    pub new_seed: Option<usize>,
    pub failure: Option<SutFailure>,
}

#[derive(Debug, Clone)]
pub struct FuzzReport {
    pub stats: FuzzStats,
    pub failures: Vec<FailureReport>,
}

impl FuzzReport {
    pub fn found_failure(&self) -> bool {
        self.stats.failures > 0
    }
}

/// The select-mutate-execute-update loop.
///
/// Owns the population and the global coverage map; nothing else writes to
/// them. Creating a fuzzer executes every initial input once; `run` then
/// iterates until its budget is spent, after which the fuzzer is stopped
/// for good.
pub struct Fuzzer<E: Executor> {
    executor: E,
    mutator: Box<dyn Mutator>,
    scheduler: Scheduler,
    corpus: InMemoryCorpus,
    feedback: CoverageFeedback,
    oracle: FailureOracle,
    rng: ChaCha8Rng,
    state: FuzzerState,
    iterations: u64,
    executions: u64,
    mutations_applied: u64,
    failures: Vec<FailureReport>,
    progress_interval: u64,
    started: Instant,
}

impl<E: Executor> Fuzzer<E> {
    pub fn new<S: CorpusSource + ?Sized>(
        executor: E,
        mutator: Box<dyn Mutator>,
        scheduler: Scheduler,
        source: &S,
        rng_seed: u64,
    ) -> Result<Self, FuzzError> {
        let initial_inputs = source.initial_corpus()?;
        if initial_inputs.is_empty() {
            return Err(ConfigError::EmptyCorpus.into());
        }
        log::debug!("Initial random seed = {rng_seed:#x}");

        let mut fuzzer = Self {
            executor,
            mutator,
            scheduler,
            corpus: InMemoryCorpus::new(),
            feedback: CoverageFeedback::new(),
            oracle: FailureOracle::new(),
            rng: ChaCha8Rng::seed_from_u64(rng_seed),
            state: FuzzerState::Running,
            iterations: 0,
            executions: 0,
            mutations_applied: 0,
            failures: Vec::new(),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            started: Instant::now(),
        };
        for input in initial_inputs {
            fuzzer.execute_baseline(input)?;
        }
        fuzzer.feedback.init(&fuzzer.corpus)?;

        log::info!(
            "Baseline complete: {} seed(s), {} distinct signature(s), schedule '{}'",
            fuzzer.corpus.len(),
            fuzzer.feedback.len(),
            fuzzer.scheduler.schedule_name()
        );
        Ok(fuzzer)
    }

    /// Builds the mutator, scheduler, initial corpus and RNG from `config`.
    ///
    /// The executor is supplied by the caller since it wraps the target, so
    /// the `[coverage]` and `[executor]` sections are only validated here.
    /// Apply them to the executor before passing it in, for example with
    /// [`GrayhoundConfig::build_executor`].
    pub fn from_config(config: &GrayhoundConfig, executor: E) -> Result<Self, FuzzError> {
        config.validate()?;
        let mutator = config.build_mutator()?;
        let scheduler = config.build_scheduler()?;
        let fuzzer = Self::new(
            executor,
            Box::new(mutator),
            scheduler,
            &config.corpus,
            config.fuzzer.rng_seed,
        )?;
        Ok(fuzzer.with_progress_interval(config.fuzzer.progress_interval))
    }

    /// Iterations between progress log lines; 0 disables them.
    pub fn with_progress_interval(mut self, interval: u64) -> Self {
        self.progress_interval = interval;
        self
    }

    fn execute_baseline(&mut self, input: String) -> Result<(), FuzzError> {
        let result = self.executor.execute(&input)?;
        self.executions += 1;
        self.scheduler.record_path(result.signature.path_id());
        if let Some(report) = self.oracle.examine(&input, &result, None) {
            log::warn!("Initial seed fails: {}", report.failure);
            self.failures.push(report);
        }
        let crashed = result.is_failure();
        self.corpus
            .add(Seed::initial(input, result.signature, crashed))?;
        Ok(())
    }

    /// Runs a single iteration.
    ///
    /// An engine fault stops the fuzzer; every later call returns
    /// [`FuzzError::Stopped`].
    pub fn step(&mut self) -> Result<IterationReport, FuzzError> {
        if self.state == FuzzerState::Stopped {
            return Err(FuzzError::Stopped);
        }
        let result = self.iterate();
        if let Err(e) = &result {
            self.state = FuzzerState::Stopped;
            log::error!("Fuzzer stopped after {} iteration(s): {e}", self.iterations);
        }
        result
    }

    fn iterate(&mut self) -> Result<IterationReport, FuzzError> {
        let iteration = self.iterations;

        let parent = self.scheduler.choose(&mut self.corpus, &mut self.rng)?;
        let seed = self
            .corpus
            .get(parent)
            .ok_or(CorpusError::InputNotFound(parent))?;
        let mutation = self
            .mutator
            .mutate(MutationInput::WrappedSeed(seed), &mut self.rng)?;
        log::trace!("Iteration {iteration}: seed {parent} -> {:?}", mutation.text);

        let result = self.executor.execute(&mutation.text)?;
        self.iterations += 1;
        self.executions += 1;
        self.mutations_applied += mutation.applied as u64;

        let failed = result.is_failure();
        let failure = result.failure().cloned();
        let path_id = result.signature.path_id();
        if let Some(report) = self.oracle.examine(&mutation.text, &result, Some(iteration)) {
            log::warn!(
                "Target failure on new path {} (iteration {iteration}): {}",
                report.path_id,
                report.failure
            );
            self.failures.push(report);
        }

        let new_seed = if self.feedback.is_interesting(&result.signature) {
            let candidate = Seed::discovered(
                mutation.text.clone(),
                result.signature,
                failed,
                parent,
                iteration,
            );
            let id = self.feedback.report_interesting(candidate, &mut self.corpus)?;
            if let Some(id) = id {
                log::debug!(
                    "New coverage at iteration {iteration}: seed {id} from parent {parent}, population {}",
                    self.corpus.len()
                );
            }
            id
        } else {
            None
        };

        let parent_seed = self
            .corpus
            .get_mut(parent)
            .ok_or(CorpusError::InputNotFound(parent))?;
        parent_seed.mutations += mutation.applied as u64;
        self.scheduler.update(parent_seed, path_id, failed);

        if self.progress_interval > 0 && self.iterations % self.progress_interval == 0 {
            self.log_progress();
        }

        Ok(IterationReport {
            iteration,
            parent,
            candidate: mutation.text,
            applied: mutation.applied,
            new_seed,
            failure,
        })
    }

    /// Iterates until `budget` is exhausted, then stops the fuzzer.
    ///
    /// An engine fault also stops the fuzzer and is returned as is.
    pub fn run(&mut self, budget: Budget) -> Result<FuzzReport, FuzzError> {
        if self.state == FuzzerState::Stopped {
            return Err(FuzzError::Stopped);
        }
        log::info!(
            "Starting fuzz loop (max trials: {:?}, max duration: {:?}) with {} seed(s)",
            budget.max_trials,
            budget.max_duration,
            self.corpus.len()
        );
        let started = Instant::now();
        let mut trials = 0u64;
        while !budget.exhausted(trials, started.elapsed()) {
            self.step()?;
            trials += 1;
        }
        self.state = FuzzerState::Stopped;

        let report = self.report();
        log::info!(
            "Fuzz loop finished in {:.2?}: {} execution(s), population {}, {} failure(s)",
            report.stats.elapsed,
            report.stats.executions,
            report.stats.population,
            report.stats.failures
        );
        Ok(report)
    }

    fn log_progress(&self) {
        let elapsed = self.started.elapsed().as_secs_f64();
        let exec_per_sec = if elapsed > 0.0 {
            self.executions as f64 / elapsed
        } else {
            0.0
        };
        log::info!(
            "Iter: {}, Population: {}, Signatures: {}, Failures: {}, Execs/sec: {:.2}",
            self.iterations,
            self.corpus.len(),
            self.feedback.len(),
            self.oracle.total_failures(),
            exec_per_sec
        );
    }

    pub fn stats(&self) -> FuzzStats {
        FuzzStats {
            iterations: self.iterations,
            executions: self.executions,
            failures: self.oracle.total_failures(),
            unique_failures: self.oracle.unique_failures(),
            mutations_applied: self.mutations_applied,
            population: self.corpus.len(),
            distinct_signatures: self.feedback.len(),
            covered_grams: self.feedback.covered_grams(),
            elapsed: self.started.elapsed(),
        }
    }

    pub fn report(&self) -> FuzzReport {
        FuzzReport {
            stats: self.stats(),
            failures: self.failures.clone(),
        }
    }

    pub fn state(&self) -> FuzzerState {
        self.state
    }

    pub fn corpus(&self) -> &dyn Corpus {
        &self.corpus
    }

    pub fn coverage(&self) -> &CoverageFeedback {
        &self.feedback
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn failures(&self) -> &[FailureReport] {
        &self.failures
    }
}
