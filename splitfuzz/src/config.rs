use std::str::FromStr;
use std::time::Duration;

/// Tunables for a guidance engine instance.
///
/// Defaults follow the values the engine was tuned with; every field can be
/// overridden programmatically or through `SPLITFUZZ_*` environment
/// variables via [`Config::from_env`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Explore/exploit trade-off of the mutation-type selector.
    pub epsilon: f64,
    /// Probability of forcing a havoc mutation regardless of channel scores.
    pub havoc_rate: f64,
    /// Favor inputs exhibiting a previously unseen structural choice shape.
    pub structural_feedback: bool,
    /// Hard cap on input buffer growth, in bytes.
    pub max_input_size: u32,
    /// Soft per-trial timeout. Zero means unlimited.
    pub single_run_timeout: Duration,
    /// Discard invalid-result inputs entirely instead of offering them to
    /// the saving criteria.
    pub save_only_valid: bool,
    /// Yield end-of-stream when an input's recorded bytes are exhausted,
    /// instead of synthesizing fresh random bytes.
    pub eof_when_exhausted: bool,
    /// Let a new input steal the full responsibility set of saved inputs it
    /// subsumes (biases the corpus toward smaller/broader inputs).
    pub steal_responsibility: bool,
    /// Save inputs whose only merit is changing hit-count buckets (`+count`).
    pub save_new_counts: bool,
    /// Save valid inputs that increase valid-cumulative coverage (`+valid`).
    pub validity_fuzzing: bool,
    /// Stop the campaign as soon as one unique failure has been recorded.
    pub stop_on_failure: bool,
    /// Trial budget for the campaign.
    pub max_trials: u64,
    /// Wall-clock budget for the campaign.
    pub max_duration: Option<Duration>,
    /// Abort if this many trials pass while the corpus is still empty.
    pub max_fruitless_trials: u64,
    /// Mean of the geometric distribution driving stacked mutation counts.
    pub mean_mutation_count: f64,
    /// Mean of the geometric distribution driving mutation sizes, in bytes.
    pub mean_mutation_size: f64,
    /// Baseline number of children generated per parent before advancing.
    pub children_baseline: u32,
    /// Multiplier applied to the children target of favored parents.
    pub favored_multiplier: u32,
    /// Minimum interval between two stats-stream rows.
    pub stats_refresh: Duration,
    /// Deterministic seed for the engine's entropy source, if any.
    pub rng_seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            epsilon: 0.2,
            havoc_rate: 0.1,
            structural_feedback: false,
            max_input_size: 10240,
            single_run_timeout: Duration::ZERO,
            save_only_valid: false,
            eof_when_exhausted: false,
            steal_responsibility: false,
            save_new_counts: true,
            validity_fuzzing: true,
            stop_on_failure: false,
            max_trials: u64::MAX,
            max_duration: None,
            max_fruitless_trials: 100_000,
            mean_mutation_count: 8.0,
            mean_mutation_size: 4.0,
            children_baseline: 50,
            favored_multiplier: 20,
            stats_refresh: Duration::from_secs(30),
            rng_seed: None,
        }
    }
}

impl Config {
    /// Builds a configuration from defaults overridden by `SPLITFUZZ_*`
    /// environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        read_env("SPLITFUZZ_EPSILON", &mut cfg.epsilon);
        read_env("SPLITFUZZ_HAVOC_RATE", &mut cfg.havoc_rate);
        read_env("SPLITFUZZ_STRUCTURAL_FEEDBACK", &mut cfg.structural_feedback);
        read_env("SPLITFUZZ_MAX_INPUT_SIZE", &mut cfg.max_input_size);
        read_env("SPLITFUZZ_SAVE_ONLY_VALID", &mut cfg.save_only_valid);
        read_env("SPLITFUZZ_EOF_WHEN_EXHAUSTED", &mut cfg.eof_when_exhausted);
        read_env(
            "SPLITFUZZ_STEAL_RESPONSIBILITY",
            &mut cfg.steal_responsibility,
        );
        read_env("SPLITFUZZ_SAVE_NEW_COUNTS", &mut cfg.save_new_counts);
        read_env("SPLITFUZZ_VALIDITY_FUZZING", &mut cfg.validity_fuzzing);
        read_env("SPLITFUZZ_STOP_ON_FAILURE", &mut cfg.stop_on_failure);
        read_env("SPLITFUZZ_MAX_TRIALS", &mut cfg.max_trials);
        read_env(
            "SPLITFUZZ_MAX_FRUITLESS_TRIALS",
            &mut cfg.max_fruitless_trials,
        );

        let mut timeout_ms: u64 = 0;
        read_env("SPLITFUZZ_SINGLE_RUN_TIMEOUT_MS", &mut timeout_ms);
        if timeout_ms > 0 {
            cfg.single_run_timeout = Duration::from_millis(timeout_ms);
        }

        let mut duration_secs: u64 = 0;
        read_env("SPLITFUZZ_MAX_DURATION_SECS", &mut duration_secs);
        if duration_secs > 0 {
            cfg.max_duration = Some(Duration::from_secs(duration_secs));
        }

        if let Ok(raw) = std::env::var("SPLITFUZZ_RNG_SEED") {
            match raw.parse() {
                Ok(seed) => cfg.rng_seed = Some(seed),
                Err(_) => log::warn!("ignoring unparsable SPLITFUZZ_RNG_SEED: {raw:?}"),
            }
        }

        cfg
    }
}

fn read_env<T: FromStr>(name: &str, slot: &mut T) {
    if let Ok(raw) = std::env::var(name) {
        match raw.parse() {
            Ok(value) => *slot = value,
            Err(_) => log::warn!("ignoring unparsable {name}: {raw:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.epsilon, 0.2);
        assert_eq!(cfg.havoc_rate, 0.1);
        assert!(!cfg.structural_feedback);
        assert_eq!(cfg.max_input_size, 10240);
        assert_eq!(cfg.single_run_timeout, Duration::ZERO);
        assert_eq!(cfg.children_baseline, 50);
        assert_eq!(cfg.favored_multiplier, 20);
    }
}
