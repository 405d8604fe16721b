//! Serializable campaign snapshots for warm starts.
//!
//! A snapshot carries the coverage state, trial counters, unique-path sets
//! and branch hit counts of a running campaign; the saved-input corpus is
//! deliberately excluded (corpus files on disk are the durable form of the
//! inputs themselves).

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::coverage::{CoverageMap, EdgeId};
use crate::diversity::DiversityMetrics;
use crate::error::{GuidanceError, Result};
use crate::guidance::GuidanceEngine;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignSnapshot {
    pub cumulative: Vec<(EdgeId, u32)>,
    pub valid_cumulative: Vec<(EdgeId, u32)>,
    pub unique_paths: Vec<u64>,
    pub unique_valid_paths: Vec<u64>,
    pub branch_hits: Vec<(EdgeId, u64)>,
    pub trials: u64,
    pub valid_trials: u64,
    pub invalid_trials: u64,
    pub timeouts: u64,
}

impl CampaignSnapshot {
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| GuidanceError::io(path, e))?;
        serde_json::to_writer(BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn read_json(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| GuidanceError::io(path, e))?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

impl GuidanceEngine {
    /// Exports the current campaign state.
    pub fn snapshot(&self) -> CampaignSnapshot {
        let mut unique_paths: Vec<u64> = self.unique_paths.iter().copied().collect();
        unique_paths.sort_unstable();
        let mut unique_valid_paths: Vec<u64> = self.unique_valid_paths.iter().copied().collect();
        unique_valid_paths.sort_unstable();
        CampaignSnapshot {
            cumulative: self.cumulative.to_sparse(),
            valid_cumulative: self.valid_cumulative.to_sparse(),
            unique_paths,
            unique_valid_paths,
            branch_hits: self.diversity.to_entries(),
            trials: self.trials,
            valid_trials: self.valid_trials,
            invalid_trials: self.invalid_trials,
            timeouts: self.timeouts,
        }
    }

    /// Warm-starts this engine from a snapshot: inputs saved by the donor
    /// campaign will no longer look novel, so the corpus picks up where the
    /// donor left off instead of re-discovering its coverage.
    pub fn restore(&mut self, snapshot: &CampaignSnapshot) {
        self.cumulative = CoverageMap::from_sparse(&snapshot.cumulative);
        self.valid_cumulative = CoverageMap::from_sparse(&snapshot.valid_cumulative);
        self.unique_paths = snapshot.unique_paths.iter().copied().collect();
        self.unique_valid_paths = snapshot.unique_valid_paths.iter().copied().collect();
        self.diversity = DiversityMetrics::from_entries(&snapshot.branch_hits);
        self.trials = snapshot.trials;
        self.valid_trials = snapshot.valid_trials;
        self.invalid_trials = snapshot.invalid_trials;
        self.timeouts = snapshot.timeouts;
        self.note_restored_coverage();
    }
}
