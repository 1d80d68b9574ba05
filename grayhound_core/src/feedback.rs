use crate::corpus::{Corpus, Seed};
use crate::coverage::{CoverageSignature, TraceEvent};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FeedbackError {
    #[error("Corpus operation failed within feedback: {0}")]
    CorpusInteractionError(#[from] crate::corpus::CorpusError),
}

/// Decides which executions are worth keeping.
pub trait Feedback: Send + Sync {
    fn name(&self) -> &'static str;

    /// Registers what the population already covers. Called once, after
    /// the baseline executions.
    fn init(&mut self, corpus: &dyn Corpus) -> Result<(), FeedbackError>;

    /// Returns `true` if an execution with `signature` would add new
    /// behavior. Does not change any state.
    fn is_interesting(&self, signature: &CoverageSignature) -> bool;

    /// Adds `seed` to the population if its signature is still novel.
    ///
    /// # Arguments
    /// * `seed`: The candidate seed, carrying the signature of its execution.
    /// * `corpus`: The population to append to.
    ///
    /// # Returns
    /// `Some(id)` of the appended seed, `None` if the signature was already
    /// known, or a `FeedbackError` if the population rejected the seed.
    fn report_interesting(
        &mut self,
        seed: Seed,
        corpus: &mut dyn Corpus,
    ) -> Result<Option<usize>, FeedbackError>;
}

/// The global coverage map: every distinct signature observed during the
/// run. It only ever grows.
#[derive(Debug, Default)]
pub struct CoverageFeedback {
    pub known_signatures: HashSet<CoverageSignature>,
    covered_grams: HashSet<Vec<TraceEvent>>,
}

impl CoverageFeedback {
    pub fn new() -> Self {
        Self {
            known_signatures: HashSet::new(),
            covered_grams: HashSet::new(),
        }
    }

    /// Number of distinct signatures seen.
    pub fn len(&self) -> usize {
        self.known_signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known_signatures.is_empty()
    }

    /// Size of the union of all signatures, in grams.
    pub fn covered_grams(&self) -> usize {
        self.covered_grams.len()
    }

    fn insert(&mut self, signature: &CoverageSignature) -> bool {
        if self.known_signatures.contains(signature) {
            return false;
        }
        self.covered_grams
            .extend(signature.iter().map(|gram| gram.to_vec()));
        self.known_signatures.insert(signature.clone())
    }
}

impl Feedback for CoverageFeedback {
    fn name(&self) -> &'static str {
        "CoverageFeedback"
    }

    /// Registers the signatures of seeds already in the population.
    fn init(&mut self, corpus: &dyn Corpus) -> Result<(), FeedbackError> {
        for seed in corpus.seeds() {
            self.insert(&seed.signature);
        }
        Ok(())
    }

    fn is_interesting(&self, signature: &CoverageSignature) -> bool {
        !self.known_signatures.contains(signature)
    }

    fn report_interesting(
        &mut self,
        seed: Seed,
        corpus: &mut dyn Corpus,
    ) -> Result<Option<usize>, FeedbackError> {
        if self.insert(&seed.signature) {
            let id = corpus.add(seed)?;
            return Ok(Some(id));
        }
        Ok(None)
    }
}
