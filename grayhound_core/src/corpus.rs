use crate::coverage::{CoverageSignature, PathId};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Defines errors that can arise during population and corpus operations.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// The requested seed ID was not found in the population.
    #[error("Seed ID {0} not found in population")]
    InputNotFound(usize),

    /// An I/O error occurred while reading initial seeds.
    /// Contains a string describing the underlying I/O error.
    #[error("Corpus I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for CorpusError {
    fn from(err: std::io::Error) -> Self {
        CorpusError::Io(err.to_string())
    }
}

/// Where a seed came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedOrigin {
    /// Supplied by the initial corpus.
    Initial,
    /// Produced by mutating the seed at `parent` during `iteration`.
    Discovered { parent: usize, iteration: u64 },
}

/// An input retained in the population together with its scheduling state.
#[derive(Debug, Clone)]
pub struct Seed {
    pub input: String,
    /// Signature observed when the seed was accepted.
    pub signature: CoverageSignature,
    pub path_id: PathId,
    /// Number of times the schedule picked this seed for mutation.
    pub fuzzed_count: u64,
    /// Number of operator applications spent on this seed's children.
    pub mutations: u64,
    /// Energy assigned at the most recent selection round.
    pub energy: f64,
    /// Whether the seed's own execution failed when it was accepted.
    pub crashed: bool,
    /// Children of this seed whose execution failed.
    pub failing_children: u64,
    pub origin: SeedOrigin,
}

impl Seed {
    pub fn initial(input: String, signature: CoverageSignature, crashed: bool) -> Self {
        Self::with_origin(input, signature, crashed, SeedOrigin::Initial)
    }

    pub fn discovered(
        input: String,
        signature: CoverageSignature,
        crashed: bool,
        parent: usize,
        iteration: u64,
    ) -> Self {
        Self::with_origin(
            input,
            signature,
            crashed,
            SeedOrigin::Discovered { parent, iteration },
        )
    }

    fn with_origin(
        input: String,
        signature: CoverageSignature,
        crashed: bool,
        origin: SeedOrigin,
    ) -> Self {
        let path_id = signature.path_id();
        Self {
            input,
            signature,
            path_id,
            fuzzed_count: 0,
            mutations: 0,
            energy: 1.0,
            crashed,
            failing_children: 0,
            origin,
        }
    }
}

/// The seed population.
///
/// Implementations must preserve insertion order: seed IDs are indices, the
/// scheduler's round-robin fallback walks them in order, and seeds are never
/// removed during a run.
pub trait Corpus: Send + Sync {
    /// Appends a seed to the end of the population.
    ///
    /// # Arguments
    /// * `seed`: The seed to append. Its signature is not checked for
    ///   novelty here; that is the job of the `Feedback`.
    ///
    /// # Returns
    /// The new seed's ID, which is its index in insertion order, or a
    /// `CorpusError` if the backend cannot store it.
    fn add(&mut self, seed: Seed) -> Result<usize, CorpusError>;

    /// Returns the seed with the given ID, or `None` if no such seed exists.
    fn get(&self, id: usize) -> Option<&Seed>;

    fn get_mut(&mut self, id: usize) -> Option<&mut Seed>;

    /// All seeds, in insertion order.
    fn seeds(&self) -> &[Seed];

    fn seeds_mut(&mut self) -> &mut [Seed];

    fn len(&self) -> usize {
        self.seeds().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A `Vec`-backed population. Nothing is persisted across runs.
#[derive(Debug, Default)]
pub struct InMemoryCorpus {
    entries: Vec<Seed>,
}

impl InMemoryCorpus {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl Corpus for InMemoryCorpus {
    fn add(&mut self, seed: Seed) -> Result<usize, CorpusError> {
        let id = self.entries.len();
        self.entries.push(seed);
        Ok(id)
    }

    fn get(&self, id: usize) -> Option<&Seed> {
        self.entries.get(id)
    }

    fn get_mut(&mut self, id: usize) -> Option<&mut Seed> {
        self.entries.get_mut(id)
    }

    fn seeds(&self) -> &[Seed] {
        &self.entries
    }

    fn seeds_mut(&mut self) -> &mut [Seed] {
        &mut self.entries
    }
}

/// Supplies the initial corpus. Called exactly once, before the first
/// baseline execution.
pub trait CorpusSource {
    /// Produces the initial inputs, in the order they should be executed.
    ///
    /// # Returns
    /// The inputs, possibly empty (the fuzzer rejects an empty corpus), or a
    /// `CorpusError` if they could not be read.
    fn initial_corpus(&self) -> Result<Vec<String>, CorpusError>;
}

impl CorpusSource for Vec<String> {
    fn initial_corpus(&self) -> Result<Vec<String>, CorpusError> {
        Ok(self.clone())
    }
}

impl CorpusSource for [&str] {
    fn initial_corpus(&self) -> Result<Vec<String>, CorpusError> {
        Ok(self.iter().map(|s| s.to_string()).collect())
    }
}

/// Seeds read from files on disk.
///
/// Each path can point to either an individual seed file or a directory;
/// directories are read one level deep, in file name order. Invalid UTF-8 is
/// replaced rather than rejected.
#[derive(Debug, Clone, Default)]
pub struct SeedFiles {
    paths: Vec<PathBuf>,
}

impl SeedFiles {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }

    fn read_seed(path: &Path) -> Result<String, CorpusError> {
        let bytes = fs::read(path)
            .map_err(|e| CorpusError::Io(format!("Failed to read seed file {:?}: {}", path, e)))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl CorpusSource for SeedFiles {
    fn initial_corpus(&self) -> Result<Vec<String>, CorpusError> {
        let mut seeds = Vec::new();
        for path in &self.paths {
            if path.is_file() {
                seeds.push(Self::read_seed(path)?);
            } else if path.is_dir() {
                let mut files = Vec::new();
                for entry_result in fs::read_dir(path).map_err(|e| {
                    CorpusError::Io(format!("Failed to read seed directory {:?}: {}", path, e))
                })? {
                    let entry = entry_result.map_err(|e| {
                        CorpusError::Io(format!("Error reading entry in {:?}: {}", path, e))
                    })?;
                    let file_path = entry.path();
                    if file_path.is_file() {
                        files.push(file_path);
                    }
                }
                files.sort();
                for file_path in files {
                    seeds.push(Self::read_seed(&file_path)?);
                }
            } else {
                return Err(CorpusError::Io(format!(
                    "Seed path {:?} is neither a file nor a directory",
                    path
                )));
            }
        }
        log::debug!("Loaded {} seed(s) from {} path(s)", seeds.len(), self.paths.len());
        Ok(seeds)
    }
}
