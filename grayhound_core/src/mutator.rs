use crate::input::MutationInput;
use rand::Rng;
use rand::seq::SliceRandom;
use rand_core::RngCore;
use thiserror::Error;

/// Lowest printable character produced by insertion.
const PRINTABLE_MIN: u8 = 32;
/// Highest printable character produced by insertion (inclusive).
const PRINTABLE_MAX: u8 = 126;
/// Bit flips are drawn from the 7 low-order bits.
const FLIP_MAX_BIT: u32 = 6;

/// Default upper bound on stacked operator applications.
pub const DEFAULT_MAX_STACK: usize = 8;
/// Largest accepted bound for [`MutationPolicy::Stacked`].
pub const MAX_STACK: usize = 1024;
/// Default exponent bound for [`MutationPolicy::LengthScaled`].
pub const DEFAULT_MAX_POWER: u32 = 5;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MutationError {
    #[error("Mutator has no registered operators")]
    EmptyRegistry,
    #[error("Unknown mutation operator '{0}'")]
    UnknownOperator(String),
    #[error("Invalid mutation policy: {0}")]
    InvalidPolicy(String),
}

/// A pure text transformation. Randomness comes only from `rng`.
pub type OperatorFn = fn(&str, &mut dyn RngCore) -> String;

/// A named entry in the operator registry.
#[derive(Clone, Copy)]
pub struct MutationOperator {
    pub name: &'static str,
    pub apply: OperatorFn,
}

impl std::fmt::Debug for MutationOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("MutationOperator").field(&self.name).finish()
    }
}

impl MutationOperator {
    pub const fn new(name: &'static str, apply: OperatorFn) -> Self {
        Self { name, apply }
    }
}

pub fn insert_random_character(input: &str, rng: &mut dyn RngCore) -> String {
    let mut chars: Vec<char> = input.chars().collect();
    let pos = rng.random_range(0..=chars.len());
    let c = rng.random_range(PRINTABLE_MIN..=PRINTABLE_MAX) as char;
    chars.insert(pos, c);
    chars.into_iter().collect()
}

/// Falls back to insertion on empty input.
pub fn delete_random_character(input: &str, rng: &mut dyn RngCore) -> String {
    if input.is_empty() {
        return insert_random_character(input, rng);
    }
    let mut chars: Vec<char> = input.chars().collect();
    let pos = rng.random_range(0..chars.len());
    chars.remove(pos);
    chars.into_iter().collect()
}

/// XORs one character with a single bit out of its 7 low-order bits. Falls
/// back to insertion on empty input.
pub fn flip_random_character(input: &str, rng: &mut dyn RngCore) -> String {
    if input.is_empty() {
        return insert_random_character(input, rng);
    }
    let mut chars: Vec<char> = input.chars().collect();
    let pos = rng.random_range(0..chars.len());
    let bit = 1u32 << rng.random_range(0..=FLIP_MAX_BIT);
    // Flipping a low bit can never move a scalar value into the surrogate
    // range, which is 0x800-aligned.
    chars[pos] = char::from_u32(chars[pos] as u32 ^ bit).unwrap_or(chars[pos]);
    chars.into_iter().collect()
}

/// Toggles the case of one ASCII letter. Falls back to a bit flip when the
/// chosen character is not an ASCII letter.
pub fn toggle_case(input: &str, rng: &mut dyn RngCore) -> String {
    if input.is_empty() {
        return insert_random_character(input, rng);
    }
    let mut chars: Vec<char> = input.chars().collect();
    let pos = rng.random_range(0..chars.len());
    let c = chars[pos];
    if !c.is_ascii_alphabetic() {
        return flip_random_character(input, rng);
    }
    chars[pos] = if c.is_ascii_lowercase() {
        c.to_ascii_uppercase()
    } else {
        c.to_ascii_lowercase()
    };
    chars.into_iter().collect()
}

/// Swaps two random characters; picking the same position twice falls back
/// to a bit flip.
pub fn swap_characters(input: &str, rng: &mut dyn RngCore) -> String {
    if input.is_empty() {
        return flip_random_character(input, rng);
    }
    let mut chars: Vec<char> = input.chars().collect();
    let first = rng.random_range(0..chars.len());
    let second = rng.random_range(0..chars.len());
    if first == second {
        return flip_random_character(input, rng);
    }
    chars.swap(first, second);
    chars.into_iter().collect()
}

pub fn reverse(input: &str, rng: &mut dyn RngCore) -> String {
    if input.is_empty() {
        return insert_random_character(input, rng);
    }
    input.chars().rev().collect()
}

pub fn shuffle(input: &str, rng: &mut dyn RngCore) -> String {
    if input.is_empty() {
        return insert_random_character(input, rng);
    }
    let mut chars: Vec<char> = input.chars().collect();
    chars.shuffle(rng);
    chars.into_iter().collect()
}

/// The three operators every mutator starts from.
pub const BASELINE_OPERATORS: [MutationOperator; 3] = [
    MutationOperator::new("delete_random_character", delete_random_character),
    MutationOperator::new("insert_random_character", insert_random_character),
    MutationOperator::new("flip_random_character", flip_random_character),
];

/// Optional operators that can be registered on top of the baseline.
pub const EXTENDED_OPERATORS: [MutationOperator; 4] = [
    MutationOperator::new("toggle_case", toggle_case),
    MutationOperator::new("swap_characters", swap_characters),
    MutationOperator::new("reverse", reverse),
    MutationOperator::new("shuffle", shuffle),
];

/// Looks up a built-in operator by name.
pub fn builtin_operator(name: &str) -> Option<MutationOperator> {
    BASELINE_OPERATORS
        .iter()
        .chain(EXTENDED_OPERATORS.iter())
        .find(|op| op.name == name)
        .copied()
}

/// How many operators a single `mutate` call chains together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPolicy {
    /// Exactly one operator per call.
    Single,
    /// A count drawn uniformly from `[1, max]`.
    Stacked { max: usize },
    /// `min(len, 2^r)` applications with `r` uniform in `[1, max_power]`,
    /// and never fewer than one.
    LengthScaled { max_power: u32 },
}

impl Default for MutationPolicy {
    fn default() -> Self {
        MutationPolicy::LengthScaled {
            max_power: DEFAULT_MAX_POWER,
        }
    }
}

impl MutationPolicy {
    pub fn validate(&self) -> Result<(), MutationError> {
        match *self {
            MutationPolicy::Single => Ok(()),
            MutationPolicy::Stacked { max } if max == 0 => Err(MutationError::InvalidPolicy(
                "stacked policy needs max >= 1".to_string(),
            )),
            MutationPolicy::Stacked { max } if max > MAX_STACK => {
                Err(MutationError::InvalidPolicy(format!(
                    "stacked policy needs max <= {MAX_STACK}, got {max}"
                )))
            }
            MutationPolicy::LengthScaled { max_power } if max_power == 0 || max_power > 16 => {
                Err(MutationError::InvalidPolicy(format!(
                    "length-scaled policy needs 1 <= max_power <= 16, got {max_power}"
                )))
            }
            _ => Ok(()),
        }
    }

    fn applications(&self, char_len: usize, rng: &mut dyn RngCore) -> usize {
        match *self {
            MutationPolicy::Single => 1,
            MutationPolicy::Stacked { max } => rng.random_range(1..=max.clamp(1, MAX_STACK)),
            MutationPolicy::LengthScaled { max_power } => {
                let power = rng.random_range(1..=max_power.clamp(1, 16));
                char_len.min(1usize << power).max(1)
            }
        }
    }
}

/// A mutated candidate and how many operator applications produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub text: String,
    pub applied: usize,
}

/// A `Mutator` derives a new candidate input from an existing one.
///
/// Mutators only read the text of their input; wrapping the result into a
/// new seed is left to the fuzzer.
pub trait Mutator {
    /// Applies the mutator's composition policy to `input`.
    ///
    /// # Arguments
    /// * `input`: Either raw text or a seed from the population. Only the
    ///   text payload is used.
    /// * `rng`: The run's random stream. It is the only source of randomness.
    ///
    /// # Returns
    /// `Result<Mutation, MutationError>`:
    ///   - `Ok(mutation)`: The candidate text and how many operator
    ///     applications produced it.
    ///   - `Err(e)`: The mutator is misconfigured (e.g. an empty registry).
    ///     This is an engine fault, not a property of the input.
    fn mutate(
        &mut self,
        input: MutationInput<'_>,
        rng: &mut dyn RngCore,
    ) -> Result<Mutation, MutationError>;
}

/// Registry-based string mutator.
///
/// Each application picks one registered operator uniformly at random and
/// feeds its output into the next application.
#[derive(Debug, Clone)]
pub struct StringMutator {
    operators: Vec<MutationOperator>,
    policy: MutationPolicy,
}

impl Default for StringMutator {
    fn default() -> Self {
        Self::new()
    }
}

impl StringMutator {
    /// Baseline operators with the default policy.
    pub fn new() -> Self {
        Self {
            operators: BASELINE_OPERATORS.to_vec(),
            policy: MutationPolicy::default(),
        }
    }

    /// Baseline plus every extended operator.
    pub fn extended() -> Self {
        let mut mutator = Self::new();
        mutator.operators.extend_from_slice(&EXTENDED_OPERATORS);
        mutator
    }

    /// Builds a mutator from built-in operator names, in the given order.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, MutationError> {
        let operators = names
            .iter()
            .map(|name| {
                builtin_operator(name.as_ref())
                    .ok_or_else(|| MutationError::UnknownOperator(name.as_ref().to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if operators.is_empty() {
            return Err(MutationError::EmptyRegistry);
        }
        Ok(Self {
            operators,
            policy: MutationPolicy::default(),
        })
    }

    pub fn with_policy(mut self, policy: MutationPolicy) -> Result<Self, MutationError> {
        policy.validate()?;
        self.policy = policy;
        Ok(self)
    }

    /// Adds an operator to the registry. Re-registering a name replaces the
    /// earlier entry in place.
    pub fn register(&mut self, operator: MutationOperator) {
        match self.operators.iter_mut().find(|op| op.name == operator.name) {
            Some(existing) => *existing = operator,
            None => self.operators.push(operator),
        }
    }

    pub fn operators(&self) -> &[MutationOperator] {
        &self.operators
    }

    pub fn policy(&self) -> MutationPolicy {
        self.policy
    }

    /// Applies one randomly chosen operator.
    pub fn mutate_once(&self, text: &str, rng: &mut dyn RngCore) -> Result<String, MutationError> {
        if self.operators.is_empty() {
            return Err(MutationError::EmptyRegistry);
        }
        let operator = self.operators[rng.random_range(0..self.operators.len())];
        Ok((operator.apply)(text, rng))
    }
}

impl Mutator for StringMutator {
    fn mutate(
        &mut self,
        input: MutationInput<'_>,
        rng: &mut dyn RngCore,
    ) -> Result<Mutation, MutationError> {
        let applied = self.policy.applications(input.char_len(), rng);
        let mut text = input.text().to_string();
        for _ in 0..applied {
            text = self.mutate_once(&text, rng)?;
        }
        Ok(Mutation { text, applied })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::Seed;
    use crate::coverage::CoverageSignature;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    fn all_operators() -> Vec<MutationOperator> {
        BASELINE_OPERATORS
            .iter()
            .chain(EXTENDED_OPERATORS.iter())
            .copied()
            .collect()
    }

    #[test]
    fn every_operator_handles_empty_and_single_character_input() {
        let mut rng = ChaCha8Rng::from_seed([0u8; 32]);
        for op in all_operators() {
            for _ in 0..50 {
                let from_empty = (op.apply)("", &mut rng);
                assert_eq!(
                    from_empty.chars().count(),
                    1,
                    "{} on empty input should degrade to insertion",
                    op.name
                );
                let from_single = (op.apply)("q", &mut rng);
                assert!(
                    from_single.chars().count() <= 2,
                    "{} produced {:?} from a single character",
                    op.name,
                    from_single
                );
            }
        }
    }

    #[test]
    fn insert_adds_one_printable_character_anywhere() {
        let mut rng = ChaCha8Rng::from_seed([1u8; 32]);
        let mut saw_append = false;
        let mut saw_prepend = false;
        for _ in 0..500 {
            let out = insert_random_character("ab", &mut rng);
            assert_eq!(out.chars().count(), 3);
            let added: Vec<char> = out.chars().filter(|c| !"ab".contains(*c)).collect();
            for c in added {
                assert!((' '..='~').contains(&c), "Non-printable insertion {c:?}");
            }
            saw_append |= out.starts_with("ab");
            saw_prepend |= out.ends_with("ab");
        }
        assert!(saw_append && saw_prepend, "Both ends should be reachable");
    }

    #[test]
    fn delete_removes_exactly_one_character() {
        let mut rng = ChaCha8Rng::from_seed([2u8; 32]);
        for _ in 0..100 {
            let out = delete_random_character("héllo", &mut rng);
            assert_eq!(out.chars().count(), 4);
        }
    }

    #[test]
    fn flip_changes_one_character_by_one_low_bit() {
        let mut rng = ChaCha8Rng::from_seed([3u8; 32]);
        for _ in 0..200 {
            let original: Vec<char> = "abcdé".chars().collect();
            let flipped: Vec<char> = flip_random_character("abcdé", &mut rng).chars().collect();
            assert_eq!(original.len(), flipped.len());
            let diffs: Vec<u32> = original
                .iter()
                .zip(flipped.iter())
                .filter(|(a, b)| a != b)
                .map(|(a, b)| *a as u32 ^ *b as u32)
                .collect();
            assert_eq!(diffs.len(), 1);
            assert!(diffs[0].is_power_of_two() && diffs[0] < 128);
        }
    }

    #[test]
    fn toggle_case_falls_back_to_flip_for_non_letters() {
        let mut rng = ChaCha8Rng::from_seed([4u8; 32]);
        assert_eq!(toggle_case("a", &mut rng), "A");
        assert_eq!(toggle_case("Z", &mut rng), "z");
        let out = toggle_case("1", &mut rng);
        assert_ne!(out, "1");
        assert_eq!(out.chars().count(), 1);
    }

    #[test]
    fn reverse_and_shuffle_preserve_the_multiset_of_characters() {
        let mut rng = ChaCha8Rng::from_seed([5u8; 32]);
        assert_eq!(reverse("abc", &mut rng), "cba");
        let mut shuffled: Vec<char> = shuffle("grayhound", &mut rng).chars().collect();
        shuffled.sort_unstable();
        let mut expected: Vec<char> = "grayhound".chars().collect();
        expected.sort_unstable();
        assert_eq!(shuffled, expected);
    }

    #[test]
    fn single_policy_applies_exactly_one_operator() {
        let mut rng = ChaCha8Rng::from_seed([6u8; 32]);
        let mut mutator = StringMutator::new()
            .with_policy(MutationPolicy::Single)
            .unwrap();
        for _ in 0..100 {
            let mutation = mutator.mutate(MutationInput::RawText("abcd"), &mut rng).unwrap();
            assert_eq!(mutation.applied, 1);
            let len = mutation.text.chars().count();
            assert!((3..=5).contains(&len));
        }
    }

    #[test]
    fn stacked_and_length_scaled_policies_stay_within_bounds() {
        let mut rng = ChaCha8Rng::from_seed([7u8; 32]);
        let mut stacked = StringMutator::new()
            .with_policy(MutationPolicy::Stacked { max: 4 })
            .unwrap();
        let mut scaled = StringMutator::new();
        let seed = Seed::initial("abc".into(), CoverageSignature::default(), false);

        for _ in 0..200 {
            let m = stacked.mutate(MutationInput::WrappedSeed(&seed), &mut rng).unwrap();
            assert!((1..=4).contains(&m.applied));

            let m = scaled.mutate(MutationInput::WrappedSeed(&seed), &mut rng).unwrap();
            assert!((1..=3).contains(&m.applied), "capped by input length");

            let m = scaled.mutate(MutationInput::RawText(""), &mut rng).unwrap();
            assert_eq!(m.applied, 1, "empty input still gets one mutation");
        }
    }

    #[test]
    fn invalid_policies_and_registries_are_rejected() {
        assert_eq!(
            StringMutator::new()
                .with_policy(MutationPolicy::Stacked { max: 0 })
                .unwrap_err(),
            MutationError::InvalidPolicy("stacked policy needs max >= 1".into())
        );
        assert_eq!(
            StringMutator::new()
                .with_policy(MutationPolicy::Stacked { max: usize::MAX })
                .unwrap_err(),
            MutationError::InvalidPolicy(format!(
                "stacked policy needs max <= {MAX_STACK}, got {}",
                usize::MAX
            ))
        );
        assert!(
            StringMutator::new()
                .with_policy(MutationPolicy::Stacked { max: MAX_STACK })
                .is_ok()
        );
        assert!(
            StringMutator::new()
                .with_policy(MutationPolicy::LengthScaled { max_power: 0 })
                .is_err()
        );
        assert_eq!(
            StringMutator::from_names::<&str>(&[]).unwrap_err(),
            MutationError::EmptyRegistry
        );
        assert_eq!(
            StringMutator::from_names(&["insert_random_character", "explode"]).unwrap_err(),
            MutationError::UnknownOperator("explode".into())
        );
    }

    #[test]
    fn registry_can_be_built_and_extended_by_name() {
        let mut mutator = StringMutator::from_names(&["reverse"]).unwrap();
        assert_eq!(mutator.operators().len(), 1);
        mutator.register(MutationOperator::new("reverse", reverse));
        assert_eq!(mutator.operators().len(), 1, "same name replaces");
        mutator.register(MutationOperator::new("shout", |s, _rng| s.to_uppercase()));
        assert_eq!(mutator.operators().len(), 2);
        assert_eq!(StringMutator::extended().operators().len(), 7);
    }

    #[test]
    fn mutation_is_deterministic_for_a_fixed_seed() {
        let run = |seed: u64| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let mut mutator = StringMutator::extended();
            (0..20)
                .map(|_| mutator.mutate(MutationInput::RawText("fuzz"), &mut rng).unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(run(42), run(42));
    }
}
