//! The per-trial guidance state machine and the harness-facing interface.

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use rand::SeedableRng;
use rand::rngs::StdRng;
use sha2::{Digest, Sha256};

use crate::artifacts::ArtifactWriter;
use crate::choice::SplitByteSource;
use crate::config::Config;
use crate::corpus::{Corpus, Policy, RunSummary};
use crate::coverage::{CoverageMap, CoverageSink};
use crate::diversity::{DiversityMetrics, HillNumbers};
use crate::error::{GuidanceError, Result};
use crate::input::InputRecord;
use crate::mutation;

/// What the harness observed while executing one input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrialOutcome {
    /// The program under test ran to completion.
    Success,
    /// A generator or harness assumption was violated; the input is
    /// semantically invalid.
    Invalid,
    /// The program under test failed.
    Failure(FailureInfo),
    /// The harness aborted the run itself.
    Timeout,
}

/// Failure identity used for deduplication and reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureInfo {
    /// Short classifier, e.g. the panic message or exception class.
    pub kind: String,
    /// Stack frames or any other lines identifying the failure site.
    pub trace: Vec<String>,
}

impl FailureInfo {
    pub fn new(kind: impl Into<String>, trace: Vec<String>) -> Self {
        Self {
            kind: kind.into(),
            trace,
        }
    }

    /// Hex digest over kind and trace; two failures with equal digests are
    /// treated as the same bug.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.kind.as_bytes());
        for line in &self.trace {
            hasher.update(b"\n");
            hasher.update(line.as_bytes());
        }
        hasher
            .finalize()
            .iter()
            .fold(String::with_capacity(64), |mut acc, byte| {
                use std::fmt::Write;
                let _ = write!(acc, "{byte:02x}");
                acc
            })
    }
}

/// Executes one input against the program under test.
///
/// The harness drives the external generator off the byte source and reports
/// coverage events into the sink while the program runs.
pub trait Harness {
    fn run(&mut self, source: &mut SplitByteSource<'_>, sink: &CoverageSink) -> TrialOutcome;
}

impl<F> Harness for F
where
    F: FnMut(&mut SplitByteSource<'_>, &CoverageSink) -> TrialOutcome,
{
    fn run(&mut self, source: &mut SplitByteSource<'_>, sink: &CoverageSink) -> TrialOutcome {
        self(source, sink)
    }
}

/// Where the current trial's input came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// Synthesized from entropy because the corpus was empty.
    Fresh,
    /// Dequeued from the seed queue, replayed byte-for-byte.
    Seed,
    /// Mutated from a saved parent.
    Mutated { parent: u32 },
}

/// A point-in-time view of campaign progress, one row of the stats stream.
#[derive(Debug, Clone)]
pub struct CampaignStats {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub elapsed_ms: u128,
    pub cycles: u64,
    pub queue_position: usize,
    pub corpus_size: usize,
    pub favored_inputs: usize,
    pub unique_failures: usize,
    pub total_coverage: u32,
    pub valid_coverage: u32,
    pub trials: u64,
    pub valid_trials: u64,
    pub invalid_trials: u64,
    pub execs_per_sec: f64,
    pub unique_paths: usize,
    pub unique_valid_paths: usize,
    pub hill: HillNumbers,
    /// Children left for the current parent, for status displays.
    pub remaining_children: u32,
    /// `(structure, value)` reward rates of the current parent.
    pub parent_scores: Option<(f64, f64)>,
}

/// Final accounting of a finished campaign.
#[derive(Debug, Clone)]
pub struct CampaignReport {
    pub trials: u64,
    pub valid_trials: u64,
    pub invalid_trials: u64,
    pub timeouts: u64,
    pub unique_failures: usize,
    pub corpus_size: usize,
    pub cycles: u64,
    pub total_coverage: u32,
    pub hill: HillNumbers,
}

/// The guidance engine: owns all campaign state and drives trial after
/// trial until a budget is exhausted or a fatal error surfaces.
pub struct GuidanceEngine {
    cfg: Config,
    policy: Policy,
    rng: StdRng,
    sink: Arc<CoverageSink>,
    stop: Arc<AtomicBool>,

    pub(crate) cumulative: CoverageMap,
    pub(crate) valid_cumulative: CoverageMap,
    corpus: Corpus,
    seeds: VecDeque<InputRecord>,
    pub(crate) diversity: DiversityMetrics,

    pub(crate) unique_paths: HashSet<u64>,
    pub(crate) unique_valid_paths: HashSet<u64>,
    unique_failures: HashSet<String>,

    pub(crate) trials: u64,
    pub(crate) valid_trials: u64,
    pub(crate) invalid_trials: u64,
    pub(crate) timeouts: u64,

    start: Instant,
    last_stats: Option<Instant>,
    artifacts: Option<ArtifactWriter>,
}

impl GuidanceEngine {
    /// An engine with no on-disk artifacts; everything stays in memory.
    pub fn new(cfg: Config) -> Self {
        let rng = match cfg.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let policy = Policy::from_config(&cfg);
        let sink = Arc::new(CoverageSink::new(cfg.single_run_timeout));
        Self {
            policy,
            rng,
            sink,
            stop: Arc::new(AtomicBool::new(false)),
            cumulative: CoverageMap::new(),
            valid_cumulative: CoverageMap::new(),
            corpus: Corpus::new(),
            seeds: VecDeque::new(),
            diversity: DiversityMetrics::new(),
            unique_paths: HashSet::new(),
            unique_valid_paths: HashSet::new(),
            unique_failures: HashSet::new(),
            trials: 0,
            valid_trials: 0,
            invalid_trials: 0,
            timeouts: 0,
            start: Instant::now(),
            last_stats: None,
            artifacts: None,
            cfg,
        }
    }

    /// An engine persisting corpus, failures, stats and the fuzz log under
    /// `output_dir`.
    pub fn with_output_dir(cfg: Config, output_dir: impl AsRef<Path>) -> Result<Self> {
        let mut engine = Self::new(cfg);
        engine.artifacts = Some(ArtifactWriter::new(output_dir.as_ref())?);
        Ok(engine)
    }

    /// Shared handle the instrumentation reports coverage events into.
    pub fn sink(&self) -> Arc<CoverageSink> {
        Arc::clone(&self.sink)
    }

    /// Flag that, once set, ends the campaign after the current trial.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Queues a seed input. Seeds are drained byte-for-byte before any
    /// mutation happens.
    pub fn add_seed(&mut self, bytes: Vec<u8>) {
        let mut seed = InputRecord::from_seed(bytes);
        seed.desc = format!("seed:{:06}", self.seeds.len());
        self.seeds.push_back(seed);
    }

    pub fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    pub fn unique_failure_count(&self) -> usize {
        self.unique_failures.len()
    }

    fn has_more_trials(&self) -> bool {
        if self.stop.load(Ordering::Relaxed) {
            return false;
        }
        if self.trials >= self.cfg.max_trials {
            return false;
        }
        if let Some(budget) = self.cfg.max_duration
            && self.start.elapsed() >= budget
        {
            return false;
        }
        if self.cfg.stop_on_failure && !self.unique_failures.is_empty() {
            return false;
        }
        true
    }

    /// Runs trials until a budget is exhausted, the stop flag is raised, or
    /// a fatal error occurs.
    pub fn run_campaign<H: Harness>(&mut self, harness: &mut H) -> Result<CampaignReport> {
        self.start = Instant::now();
        while self.has_more_trials() {
            self.run_one_trial(harness)?;
            self.maybe_emit_stats()?;
        }
        let hill = self.diversity.hill_numbers();
        Ok(CampaignReport {
            trials: self.trials,
            valid_trials: self.valid_trials,
            invalid_trials: self.invalid_trials,
            timeouts: self.timeouts,
            unique_failures: self.unique_failures.len(),
            corpus_size: self.corpus.len(),
            cycles: self.corpus.cycles(),
            total_coverage: self.cumulative.nonzero_count(),
            hill,
        })
    }

    /// One full trial: pick an input, execute it, digest the result.
    pub fn run_one_trial<H: Harness>(&mut self, harness: &mut H) -> Result<()> {
        self.sink.begin_run();
        let (mut input, origin) = self.next_input()?;

        let outcome = {
            let mut source = SplitByteSource::new(&mut input, &mut self.rng, &self.cfg);
            harness.run(&mut source, &self.sink)
        };
        // The soft deadline is enforced here rather than by interrupting
        // the harness.
        let outcome = match outcome {
            TrialOutcome::Success | TrialOutcome::Invalid if self.sink.timed_out() => {
                TrialOutcome::Timeout
            }
            other => other,
        };

        self.trials += 1;
        let summary = self.summarize_run();

        match outcome {
            TrialOutcome::Success | TrialOutcome::Invalid => {
                let valid = outcome == TrialOutcome::Success;
                self.handle_completed(input, origin, valid, &summary)?;
            }
            TrialOutcome::Failure(info) => {
                self.handle_failure(input, info, &summary)?;
            }
            TrialOutcome::Timeout => {
                self.timeouts += 1;
                let info = FailureInfo::new("timeout", Vec::new());
                self.handle_failure(input, info, &summary)?;
            }
        }

        if self.corpus.is_empty() && self.trials >= self.cfg.max_fruitless_trials {
            return Err(GuidanceError::NoCoverageProgress {
                trials: self.trials,
            });
        }
        Ok(())
    }

    /// Selects the next input per the seed → fresh → mutate ladder.
    fn next_input(&mut self) -> Result<(InputRecord, Origin)> {
        if let Some(seed) = self.seeds.pop_front() {
            return Ok((seed, Origin::Seed));
        }
        if self.corpus.is_empty() {
            let mut fresh = InputRecord::fresh();
            fresh.desc = "random".into();
            return Ok((fresh, Origin::Fresh));
        }

        let (parent_id, completed_cycle) =
            self.corpus.select_parent(&self.cfg, &mut self.rng, self.policy);
        if completed_cycle {
            self.complete_cycle()?;
        }

        let Some(parent) = self.corpus.get(parent_id) else {
            // Arena ids are dense, so this is unreachable; fall back to a
            // fresh input rather than panic.
            let mut fresh = InputRecord::fresh();
            fresh.desc = "random".into();
            return Ok((fresh, Origin::Fresh));
        };
        let kind = mutation::choose_kind(parent, &self.cfg, &mut self.rng);
        let mut child = parent.create_child(format!("src:{parent_id:06},{}", kind.label()));
        // The attempt is booked against the parent before the mutation runs.
        if let Some(parent) = self.corpus.get_mut(parent_id) {
            parent.begin_trial(kind);
        }
        if let Some(parent) = self.corpus.get(parent_id) {
            mutation::apply(parent, &mut child, kind, &self.cfg, &mut self.rng);
        }
        Ok((child, Origin::Mutated { parent: parent_id }))
    }

    /// Extracts all per-run coverage facts in one pass under the sink lock,
    /// before any cumulative map is touched.
    fn summarize_run(&self) -> RunSummary {
        let cumulative = &self.cumulative;
        let valid_cumulative = &self.valid_cumulative;
        self.sink.with_run(|run| RunSummary {
            covered: run.covered(),
            nonzero_count: run.nonzero_count(),
            new_vs_cumulative: run.new_coverage_against(cumulative),
            new_vs_valid: run.new_coverage_against(valid_cumulative),
            path_hash: run.path_hash(),
            nonzero_hash: run.nonzero_hash(),
        })
    }

    /// Digests a `Success`/`Invalid` run: reward attribution, saving
    /// criteria, and responsibility bookkeeping.
    fn handle_completed(
        &mut self,
        mut input: InputRecord,
        origin: Origin,
        valid: bool,
        summary: &RunSummary,
    ) -> Result<()> {
        if valid {
            self.valid_trials += 1;
        } else {
            self.invalid_trials += 1;
        }

        if let Origin::Mutated { .. } = origin {
            input.validate_choices()?;
        }

        // In save-only-valid mode an invalid run contributes nothing at
        // all; letting its coverage into the cumulative map would leave
        // edges without a responsible owner.
        if !valid && self.cfg.save_only_valid {
            return Ok(());
        }

        // Reward strictly precedes the save decision: a channel earns
        // credit for reaching a new valid path whether or not the input is
        // kept.
        let novel_valid_path = valid && self.unique_valid_paths.insert(summary.path_hash);
        if novel_valid_path
            && let Origin::Mutated { parent } = origin
            && let Some(parent) = self.corpus.get_mut(parent)
        {
            parent.reward_last_mutation();
        }

        if self.unique_paths.insert(summary.path_hash) {
            self.diversity.observe_novel_path(&summary.covered);
        }

        let responsibilities = self.corpus.compute_responsibilities(
            summary,
            valid,
            input.requested() as usize,
            &self.cfg,
        );

        let changed_counts = self.sink.union_run_into(&mut self.cumulative);
        self.corpus
            .note_cumulative_nonzero(self.cumulative.nonzero_count());
        let grew_valid = if valid {
            self.sink.union_run_into(&mut self.valid_cumulative)
        } else {
            false
        };

        let mut reasons: Vec<&'static str> = Vec::new();
        if self.cfg.save_new_counts && changed_counts {
            reasons.push("+count");
        }
        if !summary.new_vs_cumulative.is_empty() {
            reasons.push("+cov");
        }
        if valid && self.cfg.validity_fuzzing && grew_valid {
            reasons.push("+valid");
        }

        if reasons.is_empty() {
            self.corpus.transfer_responsibilities(&responsibilities);
            return Ok(());
        }

        input.gc();
        for reason in &reasons {
            input.desc.push(',');
            input.desc.push_str(reason);
        }
        let parent = match origin {
            Origin::Mutated { parent } => Some(parent),
            Origin::Fresh | Origin::Seed => None,
        };
        let id = self
            .corpus
            .save(input, responsibilities, summary, valid, self.policy, parent)?;

        if let Some(saved) = self.corpus.get(id) {
            log::debug!(
                "saved input {id} ({}) with {} responsibilities",
                saved.desc,
                saved.responsibilities.len()
            );
            if let Some(artifacts) = &mut self.artifacts {
                artifacts.save_corpus_input(id, saved.bytes())?;
                artifacts.write_coverage_hash(
                    self.cumulative.path_hash(),
                    self.cumulative.nonzero_hash(),
                )?;
                artifacts.log(&format!(
                    "trial {}: saved input {id} ({})",
                    self.trials, saved.desc
                ))?;
            }
        }
        Ok(())
    }

    /// Digests a `Failure`/`Timeout` run: deduplicate by stack digest and
    /// persist first occurrences. Failing inputs never enter the corpus.
    fn handle_failure(
        &mut self,
        mut input: InputRecord,
        info: FailureInfo,
        summary: &RunSummary,
    ) -> Result<()> {
        let digest = info.digest();
        if !self.unique_failures.insert(digest.clone()) {
            return Ok(());
        }
        input.gc();
        let index = self.unique_failures.len() - 1;
        log::info!("new unique failure #{index}: {}", info.kind);
        if let Some(artifacts) = &mut self.artifacts {
            artifacts.save_failure(
                index as u32,
                input.bytes(),
                &info,
                &digest,
                self.start.elapsed().as_millis(),
                summary.path_hash,
                summary.nonzero_hash,
            )?;
            artifacts.log(&format!(
                "trial {}: failure #{index} ({}) digest {digest}",
                self.trials, info.kind
            ))?;
        }
        Ok(())
    }

    /// Cycle-boundary bookkeeping: log favored inputs, then verify the
    /// responsibility partition (skipped once coverage was reported from
    /// multiple threads).
    fn complete_cycle(&mut self) -> Result<()> {
        let favored = self.corpus.favored_count();
        log::info!(
            "cycle {} complete: corpus {} ({} favored)",
            self.corpus.cycles(),
            self.corpus.len(),
            favored
        );
        if let Some(artifacts) = &mut self.artifacts {
            artifacts.log(&format!(
                "cycle {} complete: corpus {} ({favored} favored)",
                self.corpus.cycles(),
                self.corpus.len()
            ))?;
            for input in self.corpus.inputs().filter(|i| i.is_favored()) {
                artifacts.log(&format!(
                    "  favored {:?} ({}): {} responsibilities, {} offspring",
                    input.id,
                    input.desc,
                    input.responsibilities.len(),
                    input.offspring
                ))?;
            }
        }
        if !self.sink.saw_multiple_threads() {
            self.corpus
                .check_partition(u64::from(self.cumulative.nonzero_count()))?;
        }
        Ok(())
    }

    /// Current campaign statistics; also recomputes the (rate-limited)
    /// diversity indices.
    pub fn stats(&mut self) -> CampaignStats {
        let elapsed = self.start.elapsed();
        let execs_per_sec = if elapsed.as_secs_f64() > 0.0 {
            self.trials as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let parent_scores = self.corpus.current_parent().and_then(|id| {
            self.corpus.get(id).map(|p| {
                (
                    p.score(crate::choice::Channel::Structure).rate(),
                    p.score(crate::choice::Channel::Value).rate(),
                )
            })
        });
        CampaignStats {
            timestamp: chrono::Utc::now(),
            elapsed_ms: elapsed.as_millis(),
            cycles: self.corpus.cycles(),
            queue_position: self.corpus.queue_position(),
            corpus_size: self.corpus.len(),
            favored_inputs: self.corpus.favored_count(),
            unique_failures: self.unique_failures.len(),
            total_coverage: self.cumulative.nonzero_count(),
            valid_coverage: self.valid_cumulative.nonzero_count(),
            trials: self.trials,
            valid_trials: self.valid_trials,
            invalid_trials: self.invalid_trials,
            execs_per_sec,
            unique_paths: self.unique_paths.len(),
            unique_valid_paths: self.unique_valid_paths.len(),
            hill: self.diversity.hill_numbers(),
            remaining_children: self.corpus.remaining_children(),
            parent_scores,
        }
    }

    fn maybe_emit_stats(&mut self) -> Result<()> {
        let due = match self.last_stats {
            None => true,
            Some(at) => at.elapsed() >= self.cfg.stats_refresh,
        };
        if !due || self.artifacts.is_none() {
            return Ok(());
        }
        self.last_stats = Some(Instant::now());
        let stats = self.stats();
        if let Some(artifacts) = &mut self.artifacts {
            artifacts.append_stats(&stats)?;
        }
        Ok(())
    }

    /// Lets a warm start know the coverage high-water mark it inherits.
    pub(crate) fn note_restored_coverage(&mut self) {
        self.corpus
            .note_cumulative_nonzero(self.cumulative.nonzero_count());
    }
}
