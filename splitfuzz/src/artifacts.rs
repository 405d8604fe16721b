//! On-disk campaign artifacts: corpus files, failure bundles, the stats
//! stream, the coverage-hash file and the fuzz log.
//!
//! All writes are append-or-overwrite of whole lines; nothing here is read
//! back by the engine. I/O failures are fatal to the campaign.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{GuidanceError, Result};
use crate::guidance::{CampaignStats, FailureInfo};

const STATS_HEADER: &str = "# timestamp, cycles, queue_pos, corpus_size, unique_failures, \
     total_cov, valid_cov, valid_trials, invalid_trials, execs_per_sec, \
     unique_paths, b0, b1, b2";

const FAILURE_STATS_HEADER: &str =
    "# ttd_ms, exception, stack_hash, coverage_hash, nonzero_hash, trace";

/// An append-only text file that remembers its path for error reporting.
struct LogFile {
    path: PathBuf,
    file: File,
}

impl LogFile {
    fn create(path: PathBuf, header: Option<&str>) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| GuidanceError::io(&path, e))?;
        let mut log = Self { path, file };
        if let Some(header) = header {
            log.append(header)?;
        }
        Ok(log)
    }

    fn append(&mut self, line: &str) -> Result<()> {
        writeln!(self.file, "{line}").map_err(|e| GuidanceError::io(&self.path, e))?;
        self.file
            .flush()
            .map_err(|e| GuidanceError::io(&self.path, e))
    }
}

/// Writes every campaign artifact under one output directory:
///
/// ```text
/// out/
///   corpus/id_000000 ...      raw saved input bytes
///   failures/id_000000.input  raw failing input bytes
///   failures/id_000000.trace  digest + stack lines
///   failure_info.csv          one row per unique failure
///   plot_data                 the stats stream
///   coverage_hash             cumulative path/edge-set hashes
///   fuzz.log                  human-readable event log
/// ```
pub(crate) struct ArtifactWriter {
    corpus_dir: PathBuf,
    failures_dir: PathBuf,
    coverage_hash_path: PathBuf,
    stats: LogFile,
    failure_stats: LogFile,
    fuzz_log: LogFile,
}

impl ArtifactWriter {
    pub(crate) fn new(root: &Path) -> Result<Self> {
        let corpus_dir = root.join("corpus");
        let failures_dir = root.join("failures");
        for dir in [root, corpus_dir.as_path(), failures_dir.as_path()] {
            fs::create_dir_all(dir).map_err(|e| GuidanceError::io(dir, e))?;
        }
        Ok(Self {
            corpus_dir,
            failures_dir,
            coverage_hash_path: root.join("coverage_hash"),
            stats: LogFile::create(root.join("plot_data"), Some(STATS_HEADER))?,
            failure_stats: LogFile::create(
                root.join("failure_info.csv"),
                Some(FAILURE_STATS_HEADER),
            )?,
            fuzz_log: LogFile::create(root.join("fuzz.log"), None)?,
        })
    }

    pub(crate) fn save_corpus_input(&mut self, id: u32, bytes: &[u8]) -> Result<()> {
        let path = self.corpus_dir.join(format!("id_{id:06}"));
        fs::write(&path, bytes).map_err(|e| GuidanceError::io(path, e))
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn save_failure(
        &mut self,
        index: u32,
        bytes: &[u8],
        info: &FailureInfo,
        digest: &str,
        ttd_ms: u128,
        coverage_hash: u64,
        nonzero_hash: u64,
    ) -> Result<()> {
        let input_path = self.failures_dir.join(format!("id_{index:06}.input"));
        fs::write(&input_path, bytes).map_err(|e| GuidanceError::io(input_path, e))?;

        let trace_path = self.failures_dir.join(format!("id_{index:06}.trace"));
        let mut trace = format!("{digest}\n{}\n", info.kind);
        for line in &info.trace {
            trace.push_str(line);
            trace.push('\n');
        }
        fs::write(&trace_path, trace).map_err(|e| GuidanceError::io(trace_path, e))?;

        self.failure_stats.append(&format!(
            "{ttd_ms}, {}, {digest}, {coverage_hash:016x}, {nonzero_hash:016x}, {}",
            info.kind,
            info.trace.join("|")
        ))
    }

    pub(crate) fn append_stats(&mut self, stats: &CampaignStats) -> Result<()> {
        self.stats.append(&format!(
            "{}, {}, {}, {}, {}, {}, {}, {}, {}, {:.2}, {}, {:.2}, {:.2}, {:.2}",
            stats.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            stats.cycles,
            stats.queue_position,
            stats.corpus_size,
            stats.unique_failures,
            stats.total_coverage,
            stats.valid_coverage,
            stats.valid_trials,
            stats.invalid_trials,
            stats.execs_per_sec,
            stats.unique_paths,
            stats.hill.b0,
            stats.hill.b1,
            stats.hill.b2,
        ))
    }

    /// Rewritten after every save; identifies the cumulative coverage state
    /// for cross-run comparison.
    pub(crate) fn write_coverage_hash(&mut self, path_hash: u64, nonzero_hash: u64) -> Result<()> {
        let content = format!("path {path_hash:016x}\nnonzero {nonzero_hash:016x}\n");
        fs::write(&self.coverage_hash_path, content)
            .map_err(|e| GuidanceError::io(&self.coverage_hash_path, e))
    }

    pub(crate) fn log(&mut self, message: &str) -> Result<()> {
        let now = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
        self.fuzz_log.append(&format!("[{now}] {message}"))
    }
}
