use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt;
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use thiserror::Error;

/// Window size used when no explicit n-gram size is configured.
pub const DEFAULT_NGRAM_SIZE: usize = 3;

thread_local! {
    static ACTIVE_TRACE: RefCell<Option<Vec<TraceEvent>>> = const { RefCell::new(None) };
}

/// Errors raised while installing or reading the trace hook.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoverageError {
    /// A tracker is already collecting events on this thread. Nested tracking
    /// would silently split one execution's trace in two.
    #[error("a coverage tracker is already active on this thread")]
    AlreadyTracing,
}

/// One observed event in an execution trace, usually a source location
/// reached by the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraceEvent {
    pub site: &'static str,
    pub line: u32,
}

impl TraceEvent {
    pub const fn new(site: &'static str, line: u32) -> Self {
        Self { site, line }
    }

    /// An event identified by a label alone.
    pub const fn named(label: &'static str) -> Self {
        Self {
            site: label,
            line: 0,
        }
    }
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.line == 0 {
            write!(f, "{}", self.site)
        } else {
            write!(f, "{}:{}", self.site, self.line)
        }
    }
}

/// Appends `event` to the trace of the tracker active on the current thread.
///
/// Outside of a tracked execution this is a no-op, so instrumented harness
/// code can also be called directly.
pub fn record(event: TraceEvent) {
    ACTIVE_TRACE.with(|slot| {
        if let Some(trace) = slot.borrow_mut().as_mut() {
            trace.push(event);
        }
    });
}

/// Records a trace event at the call site.
///
/// `trace_point!()` records the current file and line, `trace_point!("label")`
/// records a named event.
#[macro_export]
macro_rules! trace_point {
    () => {
        $crate::coverage::record($crate::coverage::TraceEvent::new(file!(), line!()))
    };
    ($label:expr) => {
        $crate::coverage::record($crate::coverage::TraceEvent::named($label))
    };
}

/// How a raw trace is condensed into a [`CoverageSignature`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoveragePolicy {
    /// Every window of `n` consecutive events. `n = 1` is plain site coverage.
    NGram(NonZeroUsize),
    /// The whole ordered trace as a single element.
    ExactTrace,
}

impl Default for CoveragePolicy {
    fn default() -> Self {
        match NonZeroUsize::new(DEFAULT_NGRAM_SIZE) {
            Some(n) => CoveragePolicy::NGram(n),
            None => CoveragePolicy::ExactTrace,
        }
    }
}

impl CoveragePolicy {
    /// Derives the signature of `trace`. This is a pure function of its inputs.
    pub fn signature(&self, trace: &[TraceEvent]) -> CoverageSignature {
        let mut grams = BTreeSet::new();
        match self {
            CoveragePolicy::NGram(n) => {
                for window in trace.windows(n.get()) {
                    grams.insert(window.to_vec());
                }
            }
            CoveragePolicy::ExactTrace => {
                if !trace.is_empty() {
                    grams.insert(trace.to_vec());
                }
            }
        }
        CoverageSignature { grams }
    }
}

/// MD5 digest of a signature's canonical encoding. Cheap to copy and to use
/// as a map key for per-path statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathId(pub [u8; 16]);

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// The behavioral summary of one execution: a set of ordered event tuples.
///
/// Two executions are considered equivalent iff their signatures are equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoverageSignature {
    grams: BTreeSet<Vec<TraceEvent>>,
}

impl CoverageSignature {
    pub fn len(&self) -> usize {
        self.grams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grams.is_empty()
    }

    pub fn contains(&self, gram: &[TraceEvent]) -> bool {
        self.grams.contains(gram)
    }

    pub fn iter(&self) -> impl Iterator<Item = &[TraceEvent]> {
        self.grams.iter().map(Vec::as_slice)
    }

    pub fn union(&self, other: &CoverageSignature) -> CoverageSignature {
        CoverageSignature {
            grams: self.grams.union(&other.grams).cloned().collect(),
        }
    }

    pub fn is_subset(&self, other: &CoverageSignature) -> bool {
        self.grams.is_subset(&other.grams)
    }

    /// Hashes the sorted grams. Lengths are encoded so that differently
    /// split sequences cannot collide by concatenation.
    pub fn path_id(&self) -> PathId {
        let mut context = md5::Context::new();
        context.consume((self.grams.len() as u64).to_le_bytes());
        for gram in &self.grams {
            context.consume((gram.len() as u64).to_le_bytes());
            for event in gram {
                context.consume((event.site.len() as u64).to_le_bytes());
                context.consume(event.site.as_bytes());
                context.consume(event.line.to_le_bytes());
            }
        }
        PathId(context.compute().0)
    }
}

impl FromIterator<Vec<TraceEvent>> for CoverageSignature {
    fn from_iter<T: IntoIterator<Item = Vec<TraceEvent>>>(iter: T) -> Self {
        Self {
            grams: iter.into_iter().collect(),
        }
    }
}

/// Scoped observation of one execution on the current thread.
///
/// `start` installs the trace hook; it is removed by `stop` or, on any other
/// exit path including unwinding, when the tracker is dropped. The tracker is
/// deliberately `!Send` since the hook is thread-local.
#[derive(Debug)]
pub struct CoverageTracker {
    policy: CoveragePolicy,
    trace: Option<Vec<TraceEvent>>,
    _thread_bound: PhantomData<*const ()>,
}

impl CoverageTracker {
    pub fn start(policy: CoveragePolicy) -> Result<Self, CoverageError> {
        ACTIVE_TRACE.with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.is_some() {
                return Err(CoverageError::AlreadyTracing);
            }
            *slot = Some(Vec::new());
            Ok(())
        })?;
        Ok(Self {
            policy,
            trace: None,
            _thread_bound: PhantomData,
        })
    }

    pub fn policy(&self) -> CoveragePolicy {
        self.policy
    }

    /// Uninstalls the hook and returns everything recorded since `start`.
    /// Calling it again returns the same trace.
    pub fn stop(&mut self) -> &[TraceEvent] {
        if self.trace.is_none() {
            let taken = ACTIVE_TRACE.with(|slot| slot.borrow_mut().take());
            self.trace = Some(taken.unwrap_or_default());
        }
        self.trace.as_deref().unwrap_or_default()
    }

    /// Stops tracking if still active and derives the signature of the trace.
    pub fn coverage(&mut self) -> CoverageSignature {
        let policy = self.policy;
        policy.signature(self.stop())
    }
}

impl Drop for CoverageTracker {
    fn drop(&mut self) {
        if self.trace.is_none() {
            ACTIVE_TRACE.with(|slot| slot.borrow_mut().take());
        }
    }
}
