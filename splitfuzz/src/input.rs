//! Saved inputs and their per-execution bookkeeping.

use std::collections::BTreeSet;
use std::hash::{DefaultHasher, Hash, Hasher};

use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::choice::{Channel, Choice};
use crate::coverage::EdgeId;
use crate::error::{GuidanceError, Result};
use crate::mutation::MutationKind;

/// Reward/trial counters for one mutation channel.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ChannelScore {
    pub rewards: u64,
    pub trials: u64,
}

impl ChannelScore {
    /// Empirical reward rate; zero before the first trial.
    pub fn rate(&self) -> f64 {
        if self.trials == 0 {
            0.0
        } else {
            self.rewards as f64 / self.trials as f64
        }
    }
}

/// One input: a byte buffer plus the choice ledger recorded during its last
/// execution and the corpus metadata attached once it is saved.
///
/// The buffer doubles as the replay tape. Bytes below `requested` were
/// consumed by the generator; anything beyond is garbage from a previous
/// generation and is dropped by [`InputRecord::gc`] before the input enters
/// the corpus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputRecord {
    bytes: Vec<u8>,
    structure_choices: Vec<Choice>,
    value_choices: Vec<Choice>,
    requested: u32,

    /// Arena slot in the corpus, once saved.
    pub id: Option<u32>,
    /// Provenance string, e.g. `src:000123,havoc,+cov`.
    pub desc: String,
    /// Edges this input is the designated representative for.
    pub responsibilities: BTreeSet<EdgeId>,
    /// Children fuzzed from this input so far in the current pass.
    pub offspring: i64,
    /// Whether the harness accepted this input.
    pub valid: bool,
    /// First input to exhibit its structural choice shape.
    pub novel_structure: bool,
    /// Path hash of the run that saved this input.
    pub coverage_hash: u64,
    /// Number of edges the saving run covered.
    pub nonzero_coverage: u32,

    structure_score: ChannelScore,
    value_score: ChannelScore,
    last_mutation: Option<MutationKind>,
}

impl InputRecord {
    /// An empty input; every byte will be synthesized on first use.
    pub fn fresh() -> Self {
        Self::from_seed(Vec::new())
    }

    /// An input replaying the given bytes before synthesizing new ones.
    pub fn from_seed(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            structure_choices: Vec::new(),
            value_choices: Vec::new(),
            requested: 0,
            id: None,
            desc: String::new(),
            responsibilities: BTreeSet::new(),
            offspring: -1,
            valid: false,
            novel_structure: false,
            coverage_hash: 0,
            nonzero_coverage: 0,
            structure_score: ChannelScore::default(),
            value_score: ChannelScore::default(),
            last_mutation: None,
        }
    }

    /// High-water mark of consumed bytes in the last execution.
    pub fn requested(&self) -> u32 {
        self.requested
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn structure_choices(&self) -> &[Choice] {
        &self.structure_choices
    }

    pub fn value_choices(&self) -> &[Choice] {
        &self.value_choices
    }

    /// Serves byte `key`, replaying the tape or extending it with a fresh
    /// random byte. `None` signals end-of-stream (size cap, or tape end in
    /// `eof_when_exhausted` mode).
    ///
    /// Keys must arrive strictly in order; a gap means the generator skipped
    /// bytes and the ledger can no longer be trusted.
    pub(crate) fn get_or_generate(
        &mut self,
        channel: Channel,
        key: u32,
        rng: &mut StdRng,
        max_input_size: u32,
        eof_when_exhausted: bool,
    ) -> Result<Option<u8>> {
        if key != self.requested {
            return Err(GuidanceError::OutOfOrderRequest {
                channel,
                key,
                expected: self.requested,
            });
        }
        if key >= max_input_size {
            return Ok(None);
        }
        if let Some(&byte) = self.bytes.get(key as usize) {
            self.requested += 1;
            return Ok(Some(byte));
        }
        if eof_when_exhausted {
            return Ok(None);
        }
        let byte: u8 = rng.random();
        self.bytes.push(byte);
        self.requested += 1;
        Ok(Some(byte))
    }

    pub(crate) fn push_choice(&mut self, channel: Channel, choice: Choice) {
        match channel {
            Channel::Structure => self.structure_choices.push(choice),
            Channel::Value => self.value_choices.push(choice),
        }
    }

    /// Checks that the recorded choices jointly cover the consumed prefix:
    /// the later of the two final choice ends must land exactly on the
    /// high-water mark.
    pub fn validate_choices(&self) -> Result<()> {
        let structure_end = self.structure_choices.last().map_or(0, Choice::end);
        let value_end = self.value_choices.last().map_or(0, Choice::end);
        if structure_end.max(value_end) != self.requested {
            return Err(GuidanceError::MisalignedChoices {
                requested: self.requested,
                structure_end,
                value_end,
            });
        }
        Ok(())
    }

    /// Drops bytes beyond the high-water mark. Run after a successful
    /// execution so saved inputs carry no unread tail.
    pub fn gc(&mut self) {
        self.bytes.truncate(self.requested as usize);
        self.bytes.shrink_to_fit();
    }

    /// Hash of the structural decision shape: the byte content of every
    /// structural choice, with boolean draws reduced to their low bit.
    pub fn structure_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        for choice in &self.structure_choices {
            let range = choice.offset as usize..choice.end() as usize;
            if let Some(slice) = self.bytes.get(range) {
                if choice.is_bit() {
                    (slice[0] & 1).hash(&mut hasher);
                } else {
                    slice.hash(&mut hasher);
                }
            }
        }
        hasher.finish()
    }

    /// A mutable copy of this input's bytes, with fresh metadata and an
    /// empty ledger to be filled in by the child's own execution.
    pub fn create_child(&self, desc: String) -> InputRecord {
        let mut child = InputRecord::from_seed(self.bytes.clone());
        child.desc = desc;
        child
    }

    /// Books one mutation attempt against the channel that produced it,
    /// before the child runs.
    pub(crate) fn begin_trial(&mut self, kind: MutationKind) {
        self.last_mutation = Some(kind);
        match kind.channel() {
            Some(Channel::Structure) => self.structure_score.trials += 1,
            Some(Channel::Value) => self.value_score.trials += 1,
            None => {}
        }
    }

    /// Credits the mutation that produced the most recent child. Havoc
    /// children never earn credit.
    pub(crate) fn reward_last_mutation(&mut self) {
        match self.last_mutation.and_then(MutationKind::channel) {
            Some(Channel::Structure) => self.structure_score.rewards += 1,
            Some(Channel::Value) => self.value_score.rewards += 1,
            None => {}
        }
    }

    pub fn score(&self, channel: Channel) -> ChannelScore {
        match channel {
            Channel::Structure => self.structure_score,
            Channel::Value => self.value_score,
        }
    }

    /// Favored inputs get a larger children budget. An input is favored
    /// while it is responsible for at least one edge, or (under structural
    /// feedback) while it is the first exemplar of its structure.
    pub fn is_favored(&self) -> bool {
        !self.responsibilities.is_empty() || self.novel_structure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rand::SeedableRng;

    #[test]
    fn out_of_order_request_is_rejected() {
        let mut input = InputRecord::from_seed(vec![1, 2, 3]);
        let mut rng = StdRng::seed_from_u64(0);
        input
            .get_or_generate(Channel::Value, 0, &mut rng, 1024, false)
            .unwrap();
        let err = input
            .get_or_generate(Channel::Value, 2, &mut rng, 1024, false)
            .unwrap_err();
        assert_matches!(
            err,
            GuidanceError::OutOfOrderRequest {
                key: 2,
                expected: 1,
                ..
            }
        );
    }

    #[test]
    fn gc_drops_unread_tail() {
        let mut input = InputRecord::from_seed(vec![9; 16]);
        let mut rng = StdRng::seed_from_u64(0);
        for key in 0..5 {
            input
                .get_or_generate(Channel::Value, key, &mut rng, 1024, false)
                .unwrap();
        }
        input.gc();
        assert_eq!(input.len(), 5);
        assert_eq!(input.bytes(), &[9; 5]);
    }

    #[test]
    fn validate_rejects_uncovered_tail() {
        let mut input = InputRecord::from_seed(vec![0; 8]);
        let mut rng = StdRng::seed_from_u64(0);
        for key in 0..4 {
            input
                .get_or_generate(Channel::Structure, key, &mut rng, 1024, false)
                .unwrap();
        }
        input.push_choice(Channel::Structure, Choice::new(0, 3));
        assert_matches!(
            input.validate_choices(),
            Err(GuidanceError::MisalignedChoices {
                requested: 4,
                structure_end: 3,
                value_end: 0,
            })
        );
    }

    #[test]
    fn structure_hash_ignores_value_bytes_and_bool_high_bits() {
        let mut base = InputRecord::from_seed(vec![0x07, 0xFF, 0x10]);
        base.requested = 3;
        base.push_choice(Channel::Structure, Choice::new(0, 1));
        base.push_choice(Channel::Structure, Choice::new(1, Choice::BIT));
        base.push_choice(Channel::Value, Choice::new(2, 1));

        // Same structural bytes (0x07, odd bool), different value byte.
        let mut other = base.clone();
        other.bytes_mut()[2] = 0x55;
        assert_eq!(base.structure_hash(), other.structure_hash());

        // Boolean byte changes above the low bit do not matter.
        let mut bool_hi = base.clone();
        bool_hi.bytes_mut()[1] = 0x01;
        assert_eq!(base.structure_hash(), bool_hi.structure_hash());

        // Flipping the low bit does.
        let mut bool_flip = base.clone();
        bool_flip.bytes_mut()[1] = 0xFE;
        assert_ne!(base.structure_hash(), bool_flip.structure_hash());
    }

    #[test]
    fn scores_track_trials_and_rewards_per_channel() {
        let mut input = InputRecord::fresh();
        input.begin_trial(MutationKind::Structure);
        input.reward_last_mutation();
        input.begin_trial(MutationKind::Value);
        input.begin_trial(MutationKind::Havoc);
        input.reward_last_mutation();

        assert_eq!(input.score(Channel::Structure).rate(), 1.0);
        assert_eq!(input.score(Channel::Value).rate(), 0.0);
        assert_eq!(input.score(Channel::Structure).trials, 1);
        assert_eq!(input.score(Channel::Value).trials, 1);
    }

    #[test]
    fn favored_follows_responsibilities() {
        let mut input = InputRecord::fresh();
        assert!(!input.is_favored());
        input.responsibilities.insert(42);
        assert!(input.is_favored());
        input.responsibilities.clear();
        input.novel_structure = true;
        assert!(input.is_favored());
    }
}
