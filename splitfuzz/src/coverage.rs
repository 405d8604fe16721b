//! Edge coverage bookkeeping.
//!
//! Coverage is tracked in a fixed-capacity counter array indexed by edge id
//! modulo the capacity (collisions are tolerated, AFL-style). Cumulative maps
//! fold run counts into power-of-two hit-count buckets so that "did anything
//! new happen" stays a cheap bitwise check.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

/// Stable integer identifier of a coverage edge.
pub type EdgeId = u32;

/// Capacity of every coverage map. Odd on purpose, to reduce collisions for
/// edge ids with power-of-two strides.
pub const COVERAGE_MAP_SIZE: usize = (1 << 16) - 1;

/// A fixed-capacity array of saturating edge hit counters.
#[derive(Clone)]
pub struct CoverageMap {
    counts: Box<[u32]>,
}

impl Default for CoverageMap {
    fn default() -> Self {
        Self::new()
    }
}

impl CoverageMap {
    pub fn new() -> Self {
        Self {
            counts: vec![0u32; COVERAGE_MAP_SIZE].into_boxed_slice(),
        }
    }

    /// Capacity of the map; constant for the process lifetime.
    pub fn size(&self) -> usize {
        self.counts.len()
    }

    fn index(edge: EdgeId) -> usize {
        edge as usize % COVERAGE_MAP_SIZE
    }

    /// Resets every counter to zero.
    pub fn clear(&mut self) {
        self.counts.fill(0);
    }

    /// Increments the counter for `edge`, saturating at `u32::MAX`.
    pub fn record(&mut self, edge: EdgeId) {
        let idx = Self::index(edge);
        self.counts[idx] = self.counts[idx].saturating_add(1);
    }

    /// Increments the counter for a branch arm, folding the arm into the
    /// edge id.
    pub fn record_arm(&mut self, edge: EdgeId, arm: u32) {
        self.record(edge.wrapping_add(arm));
    }

    pub fn get(&self, edge: EdgeId) -> u32 {
        self.counts[Self::index(edge)]
    }

    /// Number of edges with a nonzero counter.
    pub fn nonzero_count(&self) -> u32 {
        self.counts.iter().filter(|&&c| c != 0).count() as u32
    }

    pub fn has_nonzero(&self) -> bool {
        self.counts.iter().any(|&c| c != 0)
    }

    /// The (ascending) indices of all covered edges.
    pub fn covered(&self) -> Vec<EdgeId> {
        self.counts
            .iter()
            .enumerate()
            .filter(|&(_, &c)| c != 0)
            .map(|(idx, _)| idx as EdgeId)
            .collect()
    }

    /// Edges nonzero in `self` but zero in `baseline`.
    pub fn new_coverage_against(&self, baseline: &CoverageMap) -> Vec<EdgeId> {
        self.counts
            .iter()
            .enumerate()
            .filter(|&(idx, &c)| c != 0 && baseline.counts[idx] == 0)
            .map(|(idx, _)| idx as EdgeId)
            .collect()
    }

    /// Folds a run map into this cumulative map: for every index, ORs in the
    /// highest set bit of the run counter. Only ever sets bits. Returns
    /// whether anything changed.
    pub fn update_bits(&mut self, run: &CoverageMap) -> bool {
        let mut changed = false;
        if !run.has_nonzero() {
            return false;
        }
        for idx in 0..COVERAGE_MAP_SIZE {
            let before = self.counts[idx];
            let after = before | highest_order_bit(run.counts[idx]);
            if after != before {
                self.counts[idx] = after;
                changed = true;
            }
        }
        changed
    }

    /// Hash over the raw counter array: identifies the execution *path*
    /// (bucketed hit counts included).
    pub fn path_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.counts.hash(&mut hasher);
        hasher.finish()
    }

    /// Hash over the sorted nonzero indices only: identifies the covered
    /// *edge set*, coarser than [`CoverageMap::path_hash`].
    pub fn nonzero_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        for (idx, &count) in self.counts.iter().enumerate() {
            if count != 0 {
                idx.hash(&mut hasher);
            }
        }
        hasher.finish()
    }

    /// Sparse `(edge, count)` pairs, for snapshot export.
    pub fn to_sparse(&self) -> Vec<(EdgeId, u32)> {
        self.counts
            .iter()
            .enumerate()
            .filter(|&(_, &c)| c != 0)
            .map(|(idx, &c)| (idx as EdgeId, c))
            .collect()
    }

    pub fn from_sparse(entries: &[(EdgeId, u32)]) -> Self {
        let mut map = Self::new();
        for &(edge, count) in entries {
            map.counts[Self::index(edge)] = count;
        }
        map
    }
}

impl std::fmt::Debug for CoverageMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoverageMap")
            .field("nonzero", &self.nonzero_count())
            .finish()
    }
}

/// Highest set bit of `x`, or zero.
fn highest_order_bit(x: u32) -> u32 {
    if x == 0 { 0 } else { 1 << (31 - x.leading_zeros()) }
}

/// How often the sink consults the wall clock, in coverage events.
const TIMEOUT_PROBE_INTERVAL: u32 = 10_000;

struct SinkState {
    run: CoverageMap,
    first_thread: Option<ThreadId>,
    multi_threaded: bool,
    events_since_probe: u32,
    run_start: Instant,
    timeout: Duration,
    timed_out: bool,
}

/// Shared destination for coverage events reported by the instrumented
/// program under test.
///
/// The program may report from threads it spawned itself; the sink latches a
/// `multi_threaded` flag the first time a second reporting thread appears,
/// which later relaxes the responsibility-partition check. The soft per-run
/// timeout is probed from inside the event callback rather than preemptively,
/// so a run that stops reporting events is never interrupted.
pub struct CoverageSink {
    state: Mutex<SinkState>,
}

impl CoverageSink {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Mutex::new(SinkState {
                run: CoverageMap::new(),
                first_thread: None,
                multi_threaded: false,
                events_since_probe: 0,
                run_start: Instant::now(),
                timeout,
                timed_out: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reports one edge execution.
    pub fn record(&self, edge: EdgeId) {
        self.record_arm(edge, 0);
    }

    /// Reports one branch-arm execution; the arm index is folded into the
    /// edge id.
    pub fn record_arm(&self, edge: EdgeId, arm: u32) {
        let mut state = self.lock();
        state.run.record_arm(edge, arm);

        let current = std::thread::current().id();
        match state.first_thread {
            None => state.first_thread = Some(current),
            Some(first) if first != current => state.multi_threaded = true,
            Some(_) => {}
        }

        state.events_since_probe += 1;
        if state.events_since_probe >= TIMEOUT_PROBE_INTERVAL {
            state.events_since_probe = 0;
            if !state.timeout.is_zero() && state.run_start.elapsed() > state.timeout {
                state.timed_out = true;
            }
        }
    }

    /// Resets the run map and timeout clock before a trial. The
    /// multi-threading latch survives across runs.
    pub(crate) fn begin_run(&self) {
        let mut state = self.lock();
        state.run.clear();
        state.events_since_probe = 0;
        state.run_start = Instant::now();
        state.timed_out = false;
    }

    /// Whether the current run blew its soft deadline.
    pub(crate) fn timed_out(&self) -> bool {
        self.lock().timed_out
    }

    /// Whether coverage was ever reported from more than one thread.
    pub(crate) fn saw_multiple_threads(&self) -> bool {
        self.lock().multi_threaded
    }

    /// Runs `f` against the current run map under the sink lock.
    pub(crate) fn with_run<R>(&self, f: impl FnOnce(&CoverageMap) -> R) -> R {
        f(&self.lock().run)
    }

    /// Folds the run map into a cumulative map under the sink lock;
    /// returns whether any bucket bit changed.
    pub(crate) fn union_run_into(&self, cumulative: &mut CoverageMap) -> bool {
        cumulative.update_bits(&self.lock().run)
    }
}
