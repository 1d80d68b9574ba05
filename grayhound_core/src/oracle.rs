use crate::coverage::PathId;
use crate::executor::{ExecutionResult, SutFailure};
use std::collections::HashSet;

/// A recorded target failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    /// The specific input that triggered the failure.
    pub input: String,
    pub failure: SutFailure,
    /// MD5 hex digest of the input, useful for naming or deduplication.
    pub input_hash: String,
    /// Path of the failing execution.
    pub path_id: PathId,
    /// Iteration of the main loop, `None` for baseline runs of the initial corpus.
    pub iteration: Option<u64>,
}

/// Turns failing executions into reports, keeping one report per failing
/// path so a single bug does not flood the results.
#[derive(Debug, Default)]
pub struct FailureOracle {
    seen_paths: HashSet<PathId>,
    total_failures: u64,
}

impl FailureOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Examines an execution. Returns a report if it failed on a path that
    /// has not failed before.
    pub fn examine<T>(
        &mut self,
        input: &str,
        result: &ExecutionResult<T>,
        iteration: Option<u64>,
    ) -> Option<FailureReport> {
        let failure = result.failure()?;
        self.total_failures += 1;
        let path_id = result.signature.path_id();
        if !self.seen_paths.insert(path_id) {
            return None;
        }
        Some(FailureReport {
            input: input.to_string(),
            failure: failure.clone(),
            input_hash: format!("{:x}", md5::compute(input.as_bytes())),
            path_id,
            iteration,
        })
    }

    /// Every failing execution examined, duplicates included.
    pub fn total_failures(&self) -> u64 {
        self.total_failures
    }

    pub fn unique_failures(&self) -> usize {
        self.seen_paths.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::{CoveragePolicy, CoverageSignature, TraceEvent};
    use std::time::Duration;

    fn result_with(
        outcome: Result<(), SutFailure>,
        labels: &[&'static str],
    ) -> ExecutionResult<()> {
        let trace: Vec<TraceEvent> = labels.iter().copied().map(TraceEvent::named).collect();
        ExecutionResult {
            outcome,
            signature: CoveragePolicy::default().signature(&trace),
            trace_len: trace.len(),
        }
    }

    #[test]
    fn failure_oracle_reports_failures_once_per_path() {
        let mut oracle = FailureOracle::new();
        let crash = result_with(Err(SutFailure::Error("boom".into())), &["s", "x", "z"]);

        let report = oracle
            .examine("xz", &crash, Some(3))
            .expect("First failure on a path should be reported");
        assert_eq!(report.input, "xz");
        assert_eq!(report.failure, SutFailure::Error("boom".into()));
        assert_eq!(report.input_hash, format!("{:x}", md5::compute(b"xz")));
        assert_eq!(report.path_id, crash.signature.path_id());
        assert_eq!(report.iteration, Some(3));

        assert!(oracle.examine("axz", &crash, Some(4)).is_none());
        assert_eq!(oracle.total_failures(), 2);
        assert_eq!(oracle.unique_failures(), 1);
    }

    #[test]
    fn failure_oracle_ignores_successful_executions() {
        let mut oracle = FailureOracle::new();
        let ok = result_with(Ok(()), &["s", "a", "b"]);
        assert!(oracle.examine("ab", &ok, None).is_none());
        assert_eq!(oracle.total_failures(), 0);
    }

    #[test]
    fn timeouts_with_empty_signatures_are_reported_once() {
        let mut oracle = FailureOracle::new();
        let timeout = ExecutionResult::<()> {
            outcome: Err(SutFailure::Timeout(Duration::from_millis(10))),
            signature: CoverageSignature::default(),
            trace_len: 0,
        };
        assert!(oracle.examine("hang", &timeout, Some(1)).is_some());
        assert!(oracle.examine("hang2", &timeout, Some(2)).is_none());
    }
}
