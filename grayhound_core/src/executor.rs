use crate::coverage::{CoverageError, CoveragePolicy, CoverageSignature, CoverageTracker};
use std::any::Any;
use std::fmt::Display;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// The ways a target execution can fail. These are expected outcomes of
/// fuzzing, not faults of the engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SutFailure {
    #[error("target returned an error: {0}")]
    Error(String),
    #[error("target panicked: {0}")]
    Panic(String),
    #[error("target timed out after {0:?}")]
    Timeout(Duration),
}

/// Faults of the execution machinery itself. These abort the run.
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Coverage tracking failed: {0}")]
    Coverage(#[from] CoverageError),
    #[error("Failed to spawn execution worker: {0}")]
    Spawn(String),
    #[error("Execution worker exited without reporting a result")]
    WorkerLost,
}

/// Outcome of one target execution. `signature` is populated on every path,
/// including failures.
#[derive(Debug)]
pub struct ExecutionResult<T> {
    pub outcome: Result<T, SutFailure>,
    pub signature: CoverageSignature,
    /// Number of raw events observed before the execution ended.
    pub trace_len: usize,
}

impl<T> ExecutionResult<T> {
    pub fn is_failure(&self) -> bool {
        self.outcome.is_err()
    }

    pub fn failure(&self) -> Option<&SutFailure> {
        self.outcome.as_ref().err()
    }
}

/// An `Executor` runs the target on one input and observes its coverage.
pub trait Executor {
    /// The value the target returns on success.
    type Output;

    /// Executes the target once on `input`.
    ///
    /// # Arguments
    /// * `input`: The candidate to feed to the target.
    ///
    /// # Returns
    /// An `ExecutionResult` whenever the target ran, even if it failed:
    /// target errors, panics and timeouts are reported in its `outcome`.
    /// An `ExecutorError` means the execution machinery itself broke and
    /// the run must stop.
    fn execute(&mut self, input: &str) -> Result<ExecutionResult<Self::Output>, ExecutorError>;
}

/// Runs an in-process harness `Fn(&str) -> Result<T, E>` under a
/// [`CoverageTracker`].
///
/// A returned `Err` and a panic are both reported as [`SutFailure`]s. With a
/// timeout configured each call runs on a worker thread; a worker that does
/// not answer in time is abandoned and the result carries an empty
/// signature.
pub struct InProcessExecutor<F, T, E>
where
    F: Fn(&str) -> Result<T, E>,
{
    harness_fn: Arc<F>,
    policy: CoveragePolicy,
    timeout: Option<Duration>,
    _marker: PhantomData<fn() -> Result<T, E>>,
}

impl<F, T, E> InProcessExecutor<F, T, E>
where
    F: Fn(&str) -> Result<T, E>,
{
    pub fn new(harness_fn: F) -> Self {
        Self {
            harness_fn: Arc::new(harness_fn),
            policy: CoveragePolicy::default(),
            timeout: None,
            _marker: PhantomData,
        }
    }

    pub fn with_policy(mut self, policy: CoveragePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn policy(&self) -> CoveragePolicy {
        self.policy
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic type".to_string()
    }
}

fn run_traced<F, T, E>(
    harness_fn: &F,
    input: &str,
    policy: CoveragePolicy,
) -> Result<ExecutionResult<T>, ExecutorError>
where
    F: Fn(&str) -> Result<T, E>,
    E: Display,
{
    let mut tracker = CoverageTracker::start(policy)?;
    let result = catch_unwind(AssertUnwindSafe(|| harness_fn(input)));

    // Coverage is taken before the outcome is looked at, so a failing
    // execution keeps everything it observed up to the failure.
    let trace_len = tracker.stop().len();
    let signature = tracker.coverage();

    let outcome = match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(SutFailure::Error(err.to_string())),
        Err(panic_payload) => Err(SutFailure::Panic(panic_message(panic_payload.as_ref()))),
    };
    Ok(ExecutionResult {
        outcome,
        signature,
        trace_len,
    })
}

impl<F, T, E> InProcessExecutor<F, T, E>
where
    F: Fn(&str) -> Result<T, E> + Send + Sync + 'static,
    T: Send + 'static,
    E: Display,
{
    fn execute_with_timeout(
        &self,
        input: &str,
        timeout: Duration,
    ) -> Result<ExecutionResult<T>, ExecutorError> {
        let harness_fn = Arc::clone(&self.harness_fn);
        let policy = self.policy;
        let owned_input = input.to_owned();
        let (sender, receiver) = mpsc::channel();

        thread::Builder::new()
            .name("grayhound-exec".to_string())
            .spawn(move || {
                let _ = sender.send(run_traced(harness_fn.as_ref(), &owned_input, policy));
            })
            .map_err(|e| ExecutorError::Spawn(e.to_string()))?;

        match receiver.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                log::warn!("Target timed out after {timeout:?}, abandoning worker");
                Ok(ExecutionResult {
                    outcome: Err(SutFailure::Timeout(timeout)),
                    signature: CoverageSignature::default(),
                    trace_len: 0,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(ExecutorError::WorkerLost),
        }
    }
}

impl<F, T, E> Executor for InProcessExecutor<F, T, E>
where
    F: Fn(&str) -> Result<T, E> + Send + Sync + 'static,
    T: Send + 'static,
    E: Display,
{
    type Output = T;

    fn execute(&mut self, input: &str) -> Result<ExecutionResult<T>, ExecutorError> {
        match self.timeout {
            Some(timeout) => self.execute_with_timeout(input, timeout),
            None => run_traced(self.harness_fn.as_ref(), input, self.policy),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::TraceEvent;
    use crate::trace_point;

    fn staged_harness(input: &str) -> Result<usize, String> {
        trace_point!("enter");
        for (idx, c) in input.chars().enumerate() {
            match c {
                'a' => trace_point!("a"),
                'b' => trace_point!("b"),
                '!' => {
                    trace_point!("bang");
                    return Err(format!("bang at {idx}"));
                }
                '#' => {
                    trace_point!("hash");
                    panic!("hash at {idx}");
                }
                _ => trace_point!("other"),
            }
        }
        trace_point!("exit");
        Ok(input.len())
    }

    fn events(labels: &[&'static str]) -> Vec<TraceEvent> {
        labels.iter().copied().map(TraceEvent::named).collect()
    }

    #[test]
    fn successful_execution_returns_value_and_signature() {
        let mut executor = InProcessExecutor::new(staged_harness);
        let result = executor.execute("ab").unwrap();

        assert_eq!(result.outcome, Ok(2));
        assert_eq!(result.trace_len, 4);
        assert_eq!(
            result.signature,
            CoveragePolicy::default().signature(&events(&["enter", "a", "b", "exit"]))
        );
    }

    #[test]
    fn returned_error_keeps_coverage_up_to_the_failure() {
        let mut executor = InProcessExecutor::new(staged_harness);
        let failing = executor.execute("ab!").unwrap();
        let passing = executor.execute("ab").unwrap();

        assert_eq!(failing.failure(), Some(&SutFailure::Error("bang at 2".into())));
        assert!(failing.trace_len >= 4, "Trace must include the failing event");
        assert_eq!(
            failing.signature,
            CoveragePolicy::default().signature(&events(&["enter", "a", "b", "bang"]))
        );
        let shared_prefix = events(&["enter", "a", "b"]);
        assert!(failing.signature.contains(&shared_prefix));
        assert!(passing.signature.contains(&shared_prefix));
        assert_ne!(failing.signature, passing.signature);
    }

    #[test]
    fn panic_is_a_failure_with_coverage_captured() {
        let mut executor = InProcessExecutor::new(staged_harness);
        let result = executor.execute("a#").unwrap();

        assert_eq!(result.failure(), Some(&SutFailure::Panic("hash at 1".into())));
        assert_eq!(result.trace_len, 3);
        assert_eq!(
            result.signature,
            CoveragePolicy::default().signature(&events(&["enter", "a", "hash"]))
        );

        // The hook was released despite the unwind.
        assert!(executor.execute("b").unwrap().outcome.is_ok());
    }

    #[test]
    fn execution_inside_an_active_tracker_is_an_engine_fault() {
        let mut executor = InProcessExecutor::new(staged_harness);
        let _outer = CoverageTracker::start(CoveragePolicy::default()).unwrap();
        match executor.execute("ab") {
            Err(ExecutorError::Coverage(CoverageError::AlreadyTracing)) => {}
            other => panic!("Expected a coverage error, got {:?}", other),
        }
    }

    #[test]
    fn timeout_executor_matches_direct_execution_for_fast_targets() {
        let mut direct = InProcessExecutor::new(staged_harness);
        let mut threaded =
            InProcessExecutor::new(staged_harness).with_timeout(Some(Duration::from_secs(5)));

        for input in ["ab", "ab!", "a#", ""] {
            let expected = direct.execute(input).unwrap();
            let actual = threaded.execute(input).unwrap();
            assert_eq!(expected.outcome, actual.outcome, "input {input:?}");
            assert_eq!(expected.signature, actual.signature, "input {input:?}");
        }
    }

    #[test]
    fn hanging_target_times_out_with_empty_signature() {
        let mut executor = InProcessExecutor::new(|input: &str| -> Result<(), String> {
            trace_point!("start");
            if input == "hang" {
                thread::sleep(Duration::from_millis(500));
            }
            Ok(())
        })
        .with_timeout(Some(Duration::from_millis(20)));

        let result = executor.execute("hang").unwrap();
        assert_eq!(
            result.failure(),
            Some(&SutFailure::Timeout(Duration::from_millis(20)))
        );
        assert!(result.signature.is_empty());
        assert_eq!(result.trace_len, 0);
    }

    #[test]
    fn exact_trace_policy_is_forwarded_to_the_tracker() {
        let mut executor =
            InProcessExecutor::new(staged_harness).with_policy(CoveragePolicy::ExactTrace);
        let result = executor.execute("ba").unwrap();
        assert_eq!(result.signature.len(), 1);
        assert!(
            result
                .signature
                .contains(&events(&["enter", "b", "a", "exit"]))
        );
    }
}
