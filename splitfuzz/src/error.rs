use std::path::PathBuf;

use thiserror::Error;

use crate::choice::Channel;

pub type Result<T> = std::result::Result<T, GuidanceError>;

/// Errors that abort a fuzzing campaign.
///
/// Harness-reported outcomes (`Invalid`, `Failure`, `Timeout`) are expected
/// results of a trial and are represented by
/// [`TrialOutcome`](crate::guidance::TrialOutcome), never by this type.
#[derive(Debug, Error)]
pub enum GuidanceError {
    /// A channel requested byte `key` before the bytes in front of it were
    /// consumed. The generator is non-deterministic or misusing the channel
    /// API; continuing would corrupt the corpus.
    #[error(
        "out-of-order byte request on {channel} channel: key = {key}, next expected = {expected}"
    )]
    OutOfOrderRequest {
        channel: Channel,
        key: u32,
        expected: u32,
    },

    /// The final recorded choice of neither channel reconciles with the total
    /// number of bytes consumed during the execution.
    #[error(
        "choice ledger misaligned with byte stream: requested = {requested}, \
         structure end = {structure_end}, value end = {value_end}"
    )]
    MisalignedChoices {
        requested: u32,
        structure_end: u32,
        value_end: u32,
    },

    /// An input became empty after truncating to its high-water mark.
    #[error("input {desc:?} is empty after truncation")]
    EmptyInput { desc: String },

    /// Too many trials without a single coverage-increasing input.
    #[error("{trials} trials without any coverage; likely all assumption violations")]
    NoCoverageProgress { trials: u64 },

    /// The union of all responsibility sets no longer matches cumulative
    /// coverage. Checked at cycle boundaries in single-threaded runs.
    #[error(
        "responsibility accounting mismatch: inputs own {owned} edges, \
         cumulative coverage has {covered}"
    )]
    ResponsibilityMismatch { owned: u64, covered: u64 },

    /// Failure to persist a corpus, failure, or stats artifact.
    #[error("failed to write {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A campaign snapshot could not be encoded or decoded.
    #[error("invalid campaign snapshot")]
    Snapshot(#[from] serde_json::Error),
}

impl GuidanceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
