use crate::corpus::{CorpusError, CorpusSource, SeedFiles};
use crate::coverage::{CoveragePolicy, DEFAULT_NGRAM_SIZE};
use crate::executor::InProcessExecutor;
use crate::fuzzer::Budget;
use crate::mutator::{
    DEFAULT_MAX_POWER, DEFAULT_MAX_STACK, MutationError, MutationPolicy, StringMutator,
};
use crate::scheduler::{
    AflFastSchedule, DEFAULT_AFLFAST_EXPONENT, DecaySchedule, PowerSchedule, Scheduler,
    SchedulerError, UniformSchedule,
};
use serde::Deserialize;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Initial corpus is empty")]
    EmptyCorpus,
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("Invalid mutator settings: {0}")]
    Mutator(#[from] MutationError),
    #[error("Invalid schedule settings: {0}")]
    Schedule(#[from] SchedulerError),
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CoveragePolicyKind {
    #[default]
    NGram,
    ExactTrace,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CoverageSettings {
    #[serde(default)]
    pub policy: CoveragePolicyKind,
    /// Window length for the n-gram policy.
    #[serde(default = "default_ngram_size")]
    pub n: usize,
}

fn default_ngram_size() -> usize {
    DEFAULT_NGRAM_SIZE
}

impl Default for CoverageSettings {
    fn default() -> Self {
        Self {
            policy: CoveragePolicyKind::default(),
            n: default_ngram_size(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MutationPolicyKind {
    Single,
    Stacked,
    #[default]
    LengthScaled,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MutatorSettings {
    /// Operator names, see [`crate::mutator::builtin_operator`].
    #[serde(default = "default_operators")]
    pub operators: Vec<String>,
    #[serde(default)]
    pub policy: MutationPolicyKind,
    #[serde(default = "default_max_stack")]
    pub max_stack: usize,
    #[serde(default = "default_max_power")]
    pub max_power: u32,
}

fn default_operators() -> Vec<String> {
    crate::mutator::BASELINE_OPERATORS
        .iter()
        .map(|op| op.name.to_string())
        .collect()
}

fn default_max_stack() -> usize {
    DEFAULT_MAX_STACK
}

fn default_max_power() -> u32 {
    DEFAULT_MAX_POWER
}

impl Default for MutatorSettings {
    fn default() -> Self {
        Self {
            operators: default_operators(),
            policy: MutationPolicyKind::default(),
            max_stack: default_max_stack(),
            max_power: default_max_power(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ScheduleKind {
    Uniform,
    #[default]
    AflFast,
    Decay,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ScheduleSettings {
    #[serde(default)]
    pub kind: ScheduleKind,
    /// Exponent of the afl-fast schedule.
    #[serde(default = "default_exponent")]
    pub exponent: f64,
    /// Starting energy of the decay schedule.
    #[serde(default = "default_decay_base")]
    pub base: f64,
    /// Maximum number of halvings of the decay schedule.
    #[serde(default = "default_decay_cap")]
    pub cap: u32,
}

fn default_exponent() -> f64 {
    DEFAULT_AFLFAST_EXPONENT
}

fn default_decay_base() -> f64 {
    1.0
}

fn default_decay_cap() -> u32 {
    10
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            kind: ScheduleKind::default(),
            exponent: default_exponent(),
            base: default_decay_base(),
            cap: default_decay_cap(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ExecutorSettings {
    /// Per-execution time limit. Unset means the target runs on the
    /// fuzzing thread with no limit.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusSettings {
    /// Inline seeds, added before any seed read from disk.
    #[serde(default)]
    pub seeds: Vec<String>,
    pub initial_seed_paths: Option<Vec<PathBuf>>,
}

impl CorpusSource for CorpusSettings {
    fn initial_corpus(&self) -> Result<Vec<String>, CorpusError> {
        let mut seeds = self.seeds.clone();
        if let Some(paths) = &self.initial_seed_paths {
            seeds.extend(SeedFiles::new(paths.clone()).initial_corpus()?);
        }
        Ok(seeds)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    /// Trial budget; 0 leaves the number of trials unbounded.
    #[serde(default = "default_iterations")]
    pub max_iterations: u64,
    #[serde(default)]
    pub max_duration_ms: Option<u64>,
    #[serde(default)]
    pub rng_seed: u64,
    /// Iterations between progress log lines; 0 disables them.
    #[serde(default = "default_progress_interval")]
    pub progress_interval: u64,
}

pub fn default_iterations() -> u64 {
    1_000_000
}

fn default_progress_interval() -> u64 {
    crate::fuzzer::DEFAULT_PROGRESS_INTERVAL
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_iterations(),
            max_duration_ms: None,
            rng_seed: 0,
            progress_interval: default_progress_interval(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct GrayhoundConfig {
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    #[serde(default)]
    pub coverage: CoverageSettings,
    #[serde(default)]
    pub mutator: MutatorSettings,
    #[serde(default)]
    pub schedule: ScheduleSettings,
    #[serde(default)]
    pub executor: ExecutorSettings,
    #[serde(default)]
    pub corpus: CorpusSettings,
}

impl GrayhoundConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: GrayhoundConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Checks every setting by building the components it describes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.coverage_policy()?;
        self.build_mutator()?;
        self.build_scheduler()?;
        self.execution_timeout()?;
        if self.fuzzer.max_iterations == 0 && self.fuzzer.max_duration_ms.is_none() {
            log::warn!("No trial or duration limit configured; the run will not end on its own");
        }
        Ok(())
    }

    pub fn coverage_policy(&self) -> Result<CoveragePolicy, ConfigError> {
        match self.coverage.policy {
            CoveragePolicyKind::ExactTrace => Ok(CoveragePolicy::ExactTrace),
            CoveragePolicyKind::NGram => NonZeroUsize::new(self.coverage.n)
                .map(CoveragePolicy::NGram)
                .ok_or_else(|| ConfigError::InvalidParameter("coverage.n must be >= 1".into())),
        }
    }

    pub fn mutation_policy(&self) -> MutationPolicy {
        match self.mutator.policy {
            MutationPolicyKind::Single => MutationPolicy::Single,
            MutationPolicyKind::Stacked => MutationPolicy::Stacked {
                max: self.mutator.max_stack,
            },
            MutationPolicyKind::LengthScaled => MutationPolicy::LengthScaled {
                max_power: self.mutator.max_power,
            },
        }
    }

    pub fn build_mutator(&self) -> Result<StringMutator, ConfigError> {
        let mutator =
            StringMutator::from_names(&self.mutator.operators)?.with_policy(self.mutation_policy())?;
        Ok(mutator)
    }

    pub fn build_schedule(&self) -> Result<Box<dyn PowerSchedule>, ConfigError> {
        let schedule: Box<dyn PowerSchedule> = match self.schedule.kind {
            ScheduleKind::Uniform => Box::new(UniformSchedule),
            ScheduleKind::AflFast => Box::new(AflFastSchedule::new(self.schedule.exponent)?),
            ScheduleKind::Decay => {
                Box::new(DecaySchedule::new(self.schedule.base, self.schedule.cap)?)
            }
        };
        Ok(schedule)
    }

    pub fn build_scheduler(&self) -> Result<Scheduler, ConfigError> {
        Ok(Scheduler::new(self.build_schedule()?))
    }

    pub fn execution_timeout(&self) -> Result<Option<Duration>, ConfigError> {
        match self.executor.timeout_ms {
            Some(0) => Err(ConfigError::InvalidParameter(
                "executor.timeout-ms must be > 0".into(),
            )),
            Some(ms) => Ok(Some(Duration::from_millis(ms))),
            None => Ok(None),
        }
    }

    /// Wraps `harness` in an executor using the `[coverage]` policy and the
    /// `[executor]` timeout.
    pub fn build_executor<F, T, E>(
        &self,
        harness: F,
    ) -> Result<InProcessExecutor<F, T, E>, ConfigError>
    where
        F: Fn(&str) -> Result<T, E>,
    {
        Ok(InProcessExecutor::new(harness)
            .with_policy(self.coverage_policy()?)
            .with_timeout(self.execution_timeout()?))
    }

    pub fn budget(&self) -> Budget {
        Budget {
            max_trials: (self.fuzzer.max_iterations > 0).then_some(self.fuzzer.max_iterations),
            max_duration: self.fuzzer.max_duration_ms.map(Duration::from_millis),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn empty_document_yields_defaults() {
        let config: GrayhoundConfig = toml::from_str("").unwrap();
        assert_eq!(config, GrayhoundConfig::default());
        assert_eq!(config.coverage_policy().unwrap(), CoveragePolicy::default());
        assert_eq!(config.mutation_policy(), MutationPolicy::default());
        assert_eq!(config.build_scheduler().unwrap().schedule_name(), "afl-fast");
        assert_eq!(config.budget(), Budget::trials(1_000_000));
        assert_eq!(config.execution_timeout().unwrap(), None);
    }

    #[test]
    fn full_document_is_parsed() {
        let config: GrayhoundConfig = toml::from_str(
            r#"
            [fuzzer]
            max-iterations = 0
            max-duration-ms = 1500
            rng-seed = 42

            [coverage]
            policy = "exact-trace"

            [mutator]
            operators = ["insert_random_character", "reverse"]
            policy = "stacked"
            max-stack = 4

            [schedule]
            kind = "decay"
            base = 8.0
            cap = 3

            [executor]
            timeout-ms = 250

            [corpus]
            seeds = ["ab", "cd"]
            "#,
        )
        .unwrap();

        config.validate().unwrap();
        assert_eq!(config.fuzzer.rng_seed, 42);
        assert_eq!(config.coverage_policy().unwrap(), CoveragePolicy::ExactTrace);
        assert_eq!(config.mutation_policy(), MutationPolicy::Stacked { max: 4 });
        let mutator = config.build_mutator().unwrap();
        assert_eq!(mutator.operators().len(), 2);
        assert_eq!(config.build_scheduler().unwrap().schedule_name(), "decay");
        assert_eq!(
            config.budget(),
            Budget::duration(Duration::from_millis(1500))
        );
        assert_eq!(
            config.execution_timeout().unwrap(),
            Some(Duration::from_millis(250))
        );
        assert_eq!(config.corpus.initial_corpus().unwrap(), vec!["ab", "cd"]);
    }

    #[test]
    fn executor_is_built_from_coverage_and_executor_sections() {
        let config: GrayhoundConfig = toml::from_str(
            "[coverage]\npolicy = \"exact-trace\"\n\n[executor]\ntimeout-ms = 500\n",
        )
        .unwrap();
        let executor = config
            .build_executor(|input: &str| -> Result<usize, String> { Ok(input.len()) })
            .unwrap();
        assert_eq!(executor.policy(), CoveragePolicy::ExactTrace);
        assert_eq!(executor.timeout(), Some(Duration::from_millis(500)));

        let mut config = GrayhoundConfig::default();
        config.executor.timeout_ms = Some(0);
        assert!(
            config
                .build_executor(|_: &str| -> Result<(), String> { Ok(()) })
                .is_err()
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<GrayhoundConfig, _> = toml::from_str("[fuzzer]\nthreads = 4\n");
        assert!(result.is_err());
    }

    #[test]
    fn invalid_settings_fail_validation() {
        let mut config = GrayhoundConfig::default();
        config.coverage.n = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidParameter(_))
        ));

        let mut config = GrayhoundConfig::default();
        config.mutator.operators = vec!["nonexistent".into()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Mutator(MutationError::UnknownOperator(_)))
        ));

        let mut config = GrayhoundConfig::default();
        config.mutator.operators.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Mutator(MutationError::EmptyRegistry))
        ));

        let mut config = GrayhoundConfig::default();
        config.mutator.policy = MutationPolicyKind::Stacked;
        config.mutator.max_stack = usize::MAX;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Mutator(MutationError::InvalidPolicy(_)))
        ));

        let mut config = GrayhoundConfig::default();
        config.schedule.exponent = -1.0;
        assert!(matches!(config.validate(), Err(ConfigError::Schedule(_))));

        let mut config = GrayhoundConfig::default();
        config.executor.timeout_ms = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_from_file_reads_seed_paths_after_inline_seeds() {
        let mut seed_file = NamedTempFile::new().unwrap();
        write!(seed_file, "from-disk").unwrap();

        let mut config_file = NamedTempFile::new().unwrap();
        writeln!(
            config_file,
            "[corpus]\nseeds = [\"inline\"]\ninitial-seed-paths = [{:?}]",
            seed_file.path()
        )
        .unwrap();

        let config = GrayhoundConfig::load_from_file(config_file.path()).unwrap();
        assert_eq!(
            config.corpus.initial_corpus().unwrap(),
            vec!["inline".to_string(), "from-disk".to_string()]
        );
    }

    #[test]
    fn load_from_file_reports_parse_errors() {
        let mut config_file = NamedTempFile::new().unwrap();
        writeln!(config_file, "[fuzzer\nmax-iterations = 1").unwrap();
        let err = GrayhoundConfig::load_from_file(config_file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse TOML"));
    }
}
