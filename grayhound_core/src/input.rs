use crate::corpus::Seed;

/// What a mutator is handed: either bare text or a seed from the population.
///
/// Mutators only ever look at the text payload; wrapping the result back into
/// a seed is the engine's job.
#[derive(Debug, Clone, Copy)]
pub enum MutationInput<'a> {
    RawText(&'a str),
    WrappedSeed(&'a Seed),
}

impl<'a> MutationInput<'a> {
    pub fn text(&self) -> &'a str {
        match self {
            MutationInput::RawText(text) => text,
            MutationInput::WrappedSeed(seed) => seed.input.as_str(),
        }
    }

    /// Length in characters, which is the unit every operator indexes by.
    pub fn char_len(&self) -> usize {
        self.text().chars().count()
    }
}

impl<'a> From<&'a str> for MutationInput<'a> {
    fn from(text: &'a str) -> Self {
        MutationInput::RawText(text)
    }
}

impl<'a> From<&'a Seed> for MutationInput<'a> {
    fn from(seed: &'a Seed) -> Self {
        MutationInput::WrappedSeed(seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::CoverageSignature;

    #[test]
    fn raw_text_and_wrapped_seed_expose_the_same_payload() {
        let seed = Seed::initial("héllo".to_string(), CoverageSignature::default(), false);
        let raw = MutationInput::from("héllo");
        let wrapped = MutationInput::from(&seed);

        assert_eq!(raw.text(), wrapped.text());
        assert_eq!(wrapped.char_len(), 5);
        assert_eq!(MutationInput::RawText("").char_len(), 0);
    }
}
