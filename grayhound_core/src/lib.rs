//! Coverage-guided greybox fuzzing of in-process string targets.
//!
//! A target instruments itself with [`trace_point!`]; the [`Fuzzer`]
//! repeatedly picks a seed from its population, mutates it, runs the
//! target on the result and keeps the candidate when its coverage
//! signature has not been seen before.

pub mod config;
pub mod corpus;
pub mod coverage;
pub mod executor;
pub mod feedback;
pub mod fuzzer;
pub mod input;
pub mod mutator;
pub mod oracle;
pub mod scheduler;

pub use config::{ConfigError, GrayhoundConfig};
pub use corpus::{Corpus, CorpusError, CorpusSource, InMemoryCorpus, Seed, SeedFiles};
pub use coverage::{CoveragePolicy, CoverageSignature, CoverageTracker, PathId, TraceEvent};
pub use executor::{ExecutionResult, Executor, ExecutorError, InProcessExecutor, SutFailure};
pub use feedback::{CoverageFeedback, Feedback, FeedbackError};
pub use fuzzer::{Budget, FuzzError, FuzzReport, FuzzStats, Fuzzer, FuzzerState};
pub use input::MutationInput;
pub use mutator::{Mutation, MutationError, MutationPolicy, Mutator, StringMutator};
pub use oracle::{FailureOracle, FailureReport};
pub use scheduler::{
    AflFastSchedule, DecaySchedule, PowerSchedule, Scheduler, SchedulerError, UniformSchedule,
};
