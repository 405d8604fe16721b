//! Coverage-guided fuzzing guidance with split structural/value byte
//! channels.
//!
//! The engine decides which saved input to mutate next, how to mutate it,
//! and whether an executed input is worth keeping. Generators consume
//! pseudo-random bytes through two independently addressable channels —
//! *structural* draws steer generator branching, *value* draws fill in leaf
//! data — and an epsilon-greedy selector biases mutation toward whichever
//! channel has recently produced more new valid behavior.
//!
//! The pieces, bottom up:
//!
//! - [`CoverageMap`] / [`CoverageSink`]: per-run and cumulative edge
//!   counters fed by the external instrumentation.
//! - [`SplitByteSource`] / [`Choice`]: the byte providers handed to
//!   generators, and the ledger of which byte ranges each draw consumed.
//! - [`InputRecord`]: one input's bytes, ledger and corpus metadata.
//! - [`mutation`]: havoc and channel-targeted mutation operators plus the
//!   epsilon-greedy kind selector.
//! - [`Corpus`]: saved inputs, edge-responsibility accounting, parent
//!   cycling.
//! - [`GuidanceEngine`]: the per-trial state machine tying it all together.
//! - [`DiversityMetrics`]: Hill-number diversity indices for reporting.
//!
//! The program under test, its instrumentation and its generator are
//! external: the engine only sees a [`Harness`] that maps a byte source to
//! a [`TrialOutcome`] while reporting edges into the shared sink.
//!
//! ```no_run
//! use splitfuzz::{Channel, Config, CoverageSink, GuidanceEngine, SplitByteSource, TrialOutcome};
//!
//! let mut engine = GuidanceEngine::new(Config::from_env());
//! let mut harness = |source: &mut SplitByteSource<'_>, sink: &CoverageSink| {
//!     let Ok(Some(byte)) = source.next_u8(Channel::Value) else {
//!         return TrialOutcome::Invalid;
//!     };
//!     sink.record(u32::from(byte % 7));
//!     TrialOutcome::Success
//! };
//! let report = engine.run_campaign(&mut harness).unwrap();
//! println!("{} trials, {} edges covered", report.trials, report.total_coverage);
//! ```

mod artifacts;
pub mod choice;
pub mod config;
pub mod corpus;
pub mod coverage;
pub mod diversity;
pub mod error;
pub mod guidance;
pub mod input;
pub mod mutation;
pub mod snapshot;

pub use choice::{Channel, Choice, SplitByteSource};
pub use config::Config;
pub use corpus::{Corpus, Policy};
pub use coverage::{COVERAGE_MAP_SIZE, CoverageMap, CoverageSink, EdgeId};
pub use diversity::{DiversityMetrics, HillNumbers};
pub use error::{GuidanceError, Result};
pub use guidance::{
    CampaignReport, CampaignStats, FailureInfo, GuidanceEngine, Harness, TrialOutcome,
};
pub use input::{ChannelScore, InputRecord};
pub use mutation::MutationKind;
pub use snapshot::CampaignSnapshot;
