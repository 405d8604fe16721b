//! Behavioral-diversity metrics over branch hit distributions.
//!
//! Every globally novel execution path contributes one hit to each edge it
//! covers. Hill numbers of order 0, 1, 2 over the resulting distribution
//! summarize corpus richness: b0 counts distinct edges, b1 is the
//! exponential of Shannon entropy, b2 the inverse Simpson index. They are
//! reporting signals only.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::coverage::EdgeId;

const DEFAULT_REFRESH: Duration = Duration::from_secs(5);

/// The three diversity indices, ordered `b0 >= b1 >= b2` for any
/// non-degenerate distribution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HillNumbers {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
}

/// Accumulates per-edge path-hit counts and serves rate-limited Hill
/// numbers.
#[derive(Debug)]
pub struct DiversityMetrics {
    hits: HashMap<EdgeId, u64>,
    total_hits: u64,
    cached: HillNumbers,
    last_computed: Option<Instant>,
    refresh: Duration,
}

impl Default for DiversityMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl DiversityMetrics {
    pub fn new() -> Self {
        Self::with_refresh(DEFAULT_REFRESH)
    }

    /// A metrics instance recomputing at most once per `refresh`.
    pub fn with_refresh(refresh: Duration) -> Self {
        Self {
            hits: HashMap::new(),
            total_hits: 0,
            cached: HillNumbers::default(),
            last_computed: None,
            refresh,
        }
    }

    /// Credits one path hit to every covered edge. Call only for executions
    /// whose path hash is globally novel; repeated paths carry no diversity
    /// information.
    pub(crate) fn observe_novel_path(&mut self, covered: &[EdgeId]) {
        for &edge in covered {
            *self.hits.entry(edge).or_insert(0) += 1;
            self.total_hits += 1;
        }
    }

    /// The current Hill numbers, recomputed at most once per refresh
    /// interval.
    pub fn hill_numbers(&mut self) -> HillNumbers {
        let due = match self.last_computed {
            None => true,
            Some(at) => at.elapsed() >= self.refresh,
        };
        if due {
            self.cached = self.compute();
            self.last_computed = Some(Instant::now());
        }
        self.cached
    }

    fn compute(&self) -> HillNumbers {
        if self.total_hits == 0 {
            return HillNumbers::default();
        }
        let total = self.total_hits as f64;
        let mut shannon = 0.0;
        let mut simpson = 0.0;
        let mut distinct = 0u64;
        for &count in self.hits.values() {
            if count == 0 {
                continue;
            }
            distinct += 1;
            let p = count as f64 / total;
            shannon -= p * p.ln();
            simpson += p * p;
        }
        HillNumbers {
            b0: distinct as f64,
            b1: shannon.exp(),
            b2: 1.0 / simpson,
        }
    }

    /// Sparse `(edge, hits)` export for campaign snapshots.
    pub(crate) fn to_entries(&self) -> Vec<(EdgeId, u64)> {
        let mut entries: Vec<_> = self.hits.iter().map(|(&e, &c)| (e, c)).collect();
        entries.sort_unstable();
        entries
    }

    pub(crate) fn from_entries(entries: &[(EdgeId, u64)]) -> Self {
        let mut metrics = Self::new();
        for &(edge, count) in entries {
            metrics.hits.insert(edge, count);
            metrics.total_hits += count;
        }
        metrics
    }
}
