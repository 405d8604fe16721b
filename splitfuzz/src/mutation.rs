//! Mutation operators and the epsilon-greedy kind selector.
//!
//! Targeted mutations rewrite byte ranges recorded in the parent's choice
//! ledger for one channel, leaving the other channel's decisions intact.
//! Havoc ignores the ledger and sprays random edits across the whole buffer.

use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::choice::Channel;
use crate::config::Config;
use crate::input::InputRecord;

/// Probability of a mutation writing zeros instead of random bytes.
const ZERO_RATE: f64 = 0.1;

/// What a child was derived from its parent with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationKind {
    /// Targeted rewrite of structural choices.
    Structure,
    /// Targeted rewrite of value choices.
    Value,
    /// Ledger-blind random edits.
    Havoc,
}

impl MutationKind {
    /// The channel credited or debited for this mutation, if any.
    pub fn channel(self) -> Option<Channel> {
        match self {
            MutationKind::Structure => Some(Channel::Structure),
            MutationKind::Value => Some(Channel::Value),
            MutationKind::Havoc => None,
        }
    }

    /// Short tag used in input provenance strings.
    pub fn label(self) -> &'static str {
        match self {
            MutationKind::Structure => "structure",
            MutationKind::Value => "value",
            MutationKind::Havoc => "havoc",
        }
    }
}

/// Picks the mutation kind for the next child of `parent`.
///
/// A havoc coin is flipped first; otherwise the choice between channels is
/// epsilon-greedy on the parent's empirical reward rates, exploring a
/// uniformly random channel with probability `epsilon` and exploiting the
/// better-scoring one the rest of the time. Channels without recorded
/// choices cannot be targeted and are substituted away.
pub(crate) fn choose_kind(parent: &InputRecord, cfg: &Config, rng: &mut StdRng) -> MutationKind {
    let have_structure = !parent.structure_choices().is_empty();
    let have_value = !parent.value_choices().is_empty();
    if !have_structure && !have_value {
        return MutationKind::Havoc;
    }
    if rng.random::<f64>() < cfg.havoc_rate {
        return MutationKind::Havoc;
    }

    let preferred = if rng.random::<f64>() < cfg.epsilon {
        random_channel(rng)
    } else {
        let structure = parent.score(Channel::Structure).rate();
        let value = parent.score(Channel::Value).rate();
        if structure > value {
            Channel::Structure
        } else if value > structure {
            Channel::Value
        } else {
            random_channel(rng)
        }
    };

    match preferred {
        Channel::Structure if !have_structure => MutationKind::Value,
        Channel::Value if !have_value => MutationKind::Structure,
        Channel::Structure => MutationKind::Structure,
        Channel::Value => MutationKind::Value,
    }
}

fn random_channel(rng: &mut StdRng) -> Channel {
    if rng.random::<bool>() {
        Channel::Structure
    } else {
        Channel::Value
    }
}

/// Mutates `child`'s bytes in place according to `kind`, using the parent's
/// choice ledger for targeted kinds.
pub(crate) fn apply(
    parent: &InputRecord,
    child: &mut InputRecord,
    kind: MutationKind,
    cfg: &Config,
    rng: &mut StdRng,
) {
    match kind {
        MutationKind::Structure => {
            fuzz_targeted(child, parent.structure_choices(), cfg, rng);
        }
        MutationKind::Value => {
            fuzz_targeted(child, parent.value_choices(), cfg, rng);
        }
        MutationKind::Havoc => fuzz_havoc(child, cfg, rng),
    }
}

/// Rewrites a stacked, geometrically distributed number of recorded choices.
/// Boolean choices are flipped in their low bit; wider choices get a prefix
/// of geometrically sized fresh bytes.
fn fuzz_targeted(child: &mut InputRecord, choices: &[crate::choice::Choice], cfg: &Config, rng: &mut StdRng) {
    if choices.is_empty() {
        return;
    }
    let mutations = sample_geometric(rng, cfg.mean_mutation_count);
    let set_to_zero = rng.random::<f64>() < ZERO_RATE;
    for _ in 0..mutations {
        let choice = choices[rng.random_range(0..choices.len())];
        let bytes = child.bytes_mut();
        if choice.is_bit() {
            if let Some(byte) = bytes.get_mut(choice.offset as usize) {
                *byte ^= 1;
            }
            continue;
        }
        let size = sample_geometric(rng, cfg.mean_mutation_size).min(choice.len());
        for i in 0..size {
            let idx = (choice.offset + i) as usize;
            if let Some(byte) = bytes.get_mut(idx) {
                *byte = if set_to_zero { 0 } else { rng.random() };
            }
        }
    }
}

/// Ledger-blind mutation over the whole buffer.
fn fuzz_havoc(child: &mut InputRecord, cfg: &Config, rng: &mut StdRng) {
    let len = child.len();
    if len == 0 {
        return;
    }
    let mutations = sample_geometric(rng, cfg.mean_mutation_count);
    let set_to_zero = rng.random::<f64>() < ZERO_RATE;
    for _ in 0..mutations {
        let offset = rng.random_range(0..len);
        let size = sample_geometric(rng, cfg.mean_mutation_size) as usize;
        let bytes = child.bytes_mut();
        for idx in offset..(offset + size).min(len) {
            bytes[idx] = if set_to_zero { 0 } else { rng.random() };
        }
    }
}

/// Samples `Geometric(p)` with `p = 1/mean` by inversion; always at least 1.
pub(crate) fn sample_geometric(rng: &mut StdRng, mean: f64) -> u32 {
    let p = 1.0 / mean;
    let u: f64 = rng.random();
    let sample = ((1.0 - u).ln() / (1.0 - p).ln()).ceil();
    (sample as u32).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::choice::Choice;
    use rand::SeedableRng;

    #[test]
    fn geometric_is_positive_with_plausible_mean() {
        let mut rng = StdRng::seed_from_u64(99);
        let mut sum = 0u64;
        const N: u64 = 20_000;
        for _ in 0..N {
            let sample = sample_geometric(&mut rng, 8.0);
            assert!(sample >= 1);
            sum += u64::from(sample);
        }
        let mean = sum as f64 / N as f64;
        assert!((6.0..10.0).contains(&mean), "observed mean {mean}");
    }

    #[test]
    fn targeted_mutation_stays_inside_choice_ranges() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut parent = InputRecord::from_seed(vec![0x11; 32]);
        // Only bytes 4..8 are structural; everything else must survive.
        parent.push_choice(Channel::Structure, Choice::new(4, 4));

        for _ in 0..50 {
            let mut child = parent.create_child("test".into());
            apply(
                &parent,
                &mut child,
                MutationKind::Structure,
                &Config::default(),
                &mut rng,
            );
            assert_eq!(&child.bytes()[..4], &[0x11; 4]);
            assert_eq!(&child.bytes()[8..], &[0x11; 24]);
        }
    }

    #[test]
    fn bit_choice_flips_only_the_low_bit() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut parent = InputRecord::from_seed(vec![0xF0]);
        parent.push_choice(Channel::Structure, Choice::new(0, Choice::BIT));

        let mut child = parent.create_child("test".into());
        apply(
            &parent,
            &mut child,
            MutationKind::Structure,
            &Config::default(),
            &mut rng,
        );
        // Any number of flips leaves the high bits alone.
        assert_eq!(child.bytes()[0] & 0xFE, 0xF0);
    }

    #[test]
    fn havoc_preserves_length() {
        let mut rng = StdRng::seed_from_u64(3);
        let parent = InputRecord::from_seed(vec![7; 64]);
        let mut child = parent.create_child("test".into());
        fuzz_havoc(&mut child, &Config::default(), &mut rng);
        assert_eq!(child.len(), 64);
    }

    #[test]
    fn havoc_zero_fill_covers_the_whole_call() {
        let mut rng = StdRng::seed_from_u64(11);
        let cfg = Config::default();
        // The all-zero coin is flipped once per call, so a single call never
        // mixes substantial zero-fill with substantial random rewrites.
        let mut mixed = 0;
        for _ in 0..200 {
            let parent = InputRecord::from_seed(vec![0xAA; 64]);
            let mut child = parent.create_child("test".into());
            fuzz_havoc(&mut child, &cfg, &mut rng);
            let zeroed = child.bytes().iter().filter(|&&b| b == 0).count();
            let randomized = child
                .bytes()
                .iter()
                .filter(|&&b| b != 0 && b != 0xAA)
                .count();
            if zeroed >= 5 && randomized >= 5 {
                mixed += 1;
            }
        }
        assert_eq!(mixed, 0, "{mixed} calls mixed zero-fill with random writes");
    }

    #[test]
    fn ledgerless_parent_always_selects_havoc() {
        let mut rng = StdRng::seed_from_u64(1);
        let parent = InputRecord::from_seed(vec![1, 2, 3]);
        for _ in 0..20 {
            assert_eq!(
                choose_kind(&parent, &Config::default(), &mut rng),
                MutationKind::Havoc
            );
        }
    }

    #[test]
    fn zero_havoc_rate_and_epsilon_exploit_the_better_channel() {
        let cfg = Config {
            havoc_rate: 0.0,
            epsilon: 0.0,
            ..Config::default()
        };
        let mut rng = StdRng::seed_from_u64(2);
        let mut parent = InputRecord::from_seed(vec![0; 8]);
        parent.push_choice(Channel::Structure, Choice::new(0, 4));
        parent.push_choice(Channel::Value, Choice::new(4, 4));
        // Structure channel has a perfect record, value a losing one.
        parent.begin_trial(MutationKind::Structure);
        parent.reward_last_mutation();
        parent.begin_trial(MutationKind::Value);

        for _ in 0..20 {
            assert_eq!(choose_kind(&parent, &cfg, &mut rng), MutationKind::Structure);
        }
    }

    #[test]
    fn full_epsilon_explores_both_channels_despite_scores() {
        let cfg = Config {
            havoc_rate: 0.0,
            epsilon: 1.0,
            ..Config::default()
        };
        let mut rng = StdRng::seed_from_u64(6);
        let mut parent = InputRecord::from_seed(vec![0; 8]);
        parent.push_choice(Channel::Structure, Choice::new(0, 4));
        parent.push_choice(Channel::Value, Choice::new(4, 4));
        // Structure channel has a perfect record, value a losing one;
        // exploration must ignore that.
        parent.begin_trial(MutationKind::Structure);
        parent.reward_last_mutation();
        parent.begin_trial(MutationKind::Value);

        let mut structure = 0;
        let mut value = 0;
        for _ in 0..200 {
            match choose_kind(&parent, &cfg, &mut rng) {
                MutationKind::Structure => structure += 1,
                MutationKind::Value => value += 1,
                MutationKind::Havoc => panic!("havoc despite zero havoc rate"),
            }
        }
        assert!(structure >= 60, "structure picked {structure}/200");
        assert!(value >= 60, "value picked {value}/200");
    }

    #[test]
    fn single_channel_ledger_redirects_targeted_mutations() {
        let cfg = Config {
            havoc_rate: 0.0,
            ..Config::default()
        };
        let mut rng = StdRng::seed_from_u64(4);
        let mut parent = InputRecord::from_seed(vec![0; 8]);
        parent.push_choice(Channel::Value, Choice::new(0, 8));
        for _ in 0..50 {
            assert_eq!(choose_kind(&parent, &cfg, &mut rng), MutationKind::Value);
        }
    }
}
