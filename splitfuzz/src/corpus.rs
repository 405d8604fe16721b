//! The corpus of saved inputs, responsibility accounting and parent cycling.

use std::collections::{BTreeSet, HashMap, HashSet};

use rand::Rng;
use rand::rngs::StdRng;

use crate::config::Config;
use crate::coverage::EdgeId;
use crate::error::{GuidanceError, Result};
use crate::input::InputRecord;

/// Per-trial coverage facts extracted from the run map before the
/// cumulative maps are unioned with it.
#[derive(Debug, Clone)]
pub(crate) struct RunSummary {
    /// All covered edges, ascending.
    pub covered: Vec<EdgeId>,
    pub nonzero_count: u32,
    /// Edges covered by the run and never before by any execution.
    pub new_vs_cumulative: Vec<EdgeId>,
    /// Edges covered by the run and never before by a valid execution.
    pub new_vs_valid: Vec<EdgeId>,
    pub path_hash: u64,
    pub nonzero_hash: u64,
}

/// Which favoring and cycling rules the corpus applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Favor only inputs that own responsibility edges.
    Baseline,
    /// Additionally favor the first exemplar of each structural shape and
    /// cycle parents by structure group.
    StructuralFeedback,
}

impl Policy {
    pub(crate) fn from_config(cfg: &Config) -> Self {
        if cfg.structural_feedback {
            Policy::StructuralFeedback
        } else {
            Policy::Baseline
        }
    }
}

/// Owns every saved input and the edge-to-owner map.
///
/// Inputs live in an arena and are addressed by their save id; the
/// responsibility map stores ids, never references. Saved inputs are never
/// evicted.
pub struct Corpus {
    inputs: Vec<InputRecord>,
    responsible: HashMap<EdgeId, u32>,

    current_parent: Option<u32>,
    queue_position: usize,
    children_generated: u32,
    target_children: u32,
    cycles: u64,
    /// Cumulative nonzero edge count, the denominator of the children
    /// budget ratio.
    max_coverage: u32,

    explored_structures: HashSet<u64>,
    /// Structure hashes in first-seen order; cycling under
    /// [`Policy::StructuralFeedback`] walks these groups.
    structure_keys: Vec<u64>,
    groups: HashMap<u64, Vec<u32>>,
    group_position: usize,
}

impl Default for Corpus {
    fn default() -> Self {
        Self::new()
    }
}

impl Corpus {
    pub fn new() -> Self {
        Self {
            inputs: Vec::new(),
            responsible: HashMap::new(),
            current_parent: None,
            queue_position: 0,
            children_generated: 0,
            target_children: 0,
            cycles: 0,
            max_coverage: 0,
            explored_structures: HashSet::new(),
            structure_keys: Vec::new(),
            groups: HashMap::new(),
            group_position: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn get(&self, id: u32) -> Option<&InputRecord> {
        self.inputs.get(id as usize)
    }

    pub(crate) fn get_mut(&mut self, id: u32) -> Option<&mut InputRecord> {
        self.inputs.get_mut(id as usize)
    }

    pub fn inputs(&self) -> impl Iterator<Item = &InputRecord> {
        self.inputs.iter()
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn queue_position(&self) -> usize {
        self.queue_position
    }

    pub fn favored_count(&self) -> usize {
        self.inputs.iter().filter(|i| i.is_favored()).count()
    }

    pub fn current_parent(&self) -> Option<u32> {
        self.current_parent
    }

    /// Number of children left before the current parent is retired.
    pub fn remaining_children(&self) -> u32 {
        self.target_children.saturating_sub(self.children_generated)
    }

    /// Records the cumulative nonzero count after a union; monotone.
    pub(crate) fn note_cumulative_nonzero(&mut self, nonzero: u32) {
        if nonzero > self.max_coverage {
            self.max_coverage = nonzero;
        }
    }

    /// The edges the current input may claim ownership of: everything newly
    /// covered, plus (optionally) whole responsibility sets stolen from
    /// saved inputs that this run strictly subsumes.
    pub(crate) fn compute_responsibilities(
        &self,
        summary: &RunSummary,
        valid: bool,
        candidate_len: usize,
        cfg: &Config,
    ) -> BTreeSet<EdgeId> {
        let mut result: BTreeSet<EdgeId> = summary.new_vs_cumulative.iter().copied().collect();
        if valid {
            result.extend(summary.new_vs_valid.iter().copied());
        }

        if cfg.steal_responsibility {
            let covered: HashSet<EdgeId> = summary.covered.iter().copied().collect();
            for input in &self.inputs {
                if input.responsibilities.is_empty() {
                    continue;
                }
                let smaller_coverage = input.nonzero_coverage < summary.nonzero_count;
                let same_coverage_bigger_bytes = input.nonzero_coverage == summary.nonzero_count
                    && input.len() > candidate_len;
                if !(smaller_coverage || same_coverage_bigger_bytes) {
                    continue;
                }
                if input.responsibilities.iter().all(|e| covered.contains(e)) {
                    result.extend(input.responsibilities.iter().copied());
                }
            }
        }
        result
    }

    /// Makes `owner` the responsible input for every edge in `edges`,
    /// removing each edge from its previous owner first. Old owners may
    /// become unfavored as a result.
    fn assign_responsibilities(&mut self, owner: u32, edges: &BTreeSet<EdgeId>) {
        for &edge in edges {
            if let Some(&previous) = self.responsible.get(&edge)
                && previous != owner
                && let Some(old) = self.inputs.get_mut(previous as usize)
            {
                old.responsibilities.remove(&edge);
            }
            self.responsible.insert(edge, owner);
        }
        if let Some(input) = self.inputs.get_mut(owner as usize) {
            input.responsibilities.extend(edges.iter().copied());
        }
    }

    /// Persists an already-executed input into the corpus.
    ///
    /// The caller has truncated the buffer to its high-water mark; an empty
    /// result is a generator consistency error. Returns the new input's id.
    pub(crate) fn save(
        &mut self,
        mut input: InputRecord,
        responsibilities: BTreeSet<EdgeId>,
        summary: &RunSummary,
        valid: bool,
        policy: Policy,
        parent: Option<u32>,
    ) -> Result<u32> {
        if input.is_empty() {
            return Err(GuidanceError::EmptyInput { desc: input.desc });
        }

        let id = self.inputs.len() as u32;
        input.id = Some(id);
        input.valid = valid;
        input.coverage_hash = summary.path_hash;
        input.nonzero_coverage = summary.nonzero_count;
        input.offspring = 0;

        let structure = input.structure_hash();
        let novel_structure = self.explored_structures.insert(structure);
        input.novel_structure = policy == Policy::StructuralFeedback && novel_structure;
        if novel_structure {
            self.structure_keys.push(structure);
        }
        self.groups.entry(structure).or_default().push(id);

        self.inputs.push(input);
        self.assign_responsibilities(id, &responsibilities);

        if let Some(parent) = parent
            && let Some(parent) = self.inputs.get_mut(parent as usize)
        {
            parent.offspring += 1;
        }
        Ok(id)
    }

    /// Hands a discarded input's computed responsibilities to the current
    /// parent so no covered edge loses its owner.
    pub(crate) fn transfer_responsibilities(&mut self, edges: &BTreeSet<EdgeId>) {
        if edges.is_empty() {
            return;
        }
        if let Some(parent) = self.current_parent {
            self.assign_responsibilities(parent, edges);
        }
    }

    /// Picks the parent for the next trial, advancing past exhausted
    /// parents. Returns the parent id and whether a full cycle just
    /// completed.
    pub(crate) fn select_parent(
        &mut self,
        cfg: &Config,
        rng: &mut StdRng,
        policy: Policy,
    ) -> (u32, bool) {
        debug_assert!(!self.inputs.is_empty());
        let mut completed_cycle = false;
        let needs_advance =
            self.current_parent.is_none() || self.children_generated >= self.target_children;
        if needs_advance {
            let id = match policy {
                Policy::Baseline => self.advance_linear(&mut completed_cycle),
                Policy::StructuralFeedback => self.advance_grouped(rng, &mut completed_cycle),
            };
            self.current_parent = Some(id);
            self.children_generated = 0;
            self.target_children = self.target_children_for(id, cfg);
        }
        self.children_generated += 1;
        if completed_cycle {
            self.cycles += 1;
        }
        (self.current_parent.unwrap_or(0), completed_cycle)
    }

    fn advance_linear(&mut self, completed_cycle: &mut bool) -> u32 {
        if self.current_parent.is_some() {
            self.queue_position = (self.queue_position + 1) % self.inputs.len();
            if self.queue_position == 0 {
                *completed_cycle = true;
            }
        }
        self.queue_position as u32
    }

    /// Cycles over structure groups, then picks within the current group
    /// with weight proportional to recency (latest save has the largest
    /// weight).
    fn advance_grouped(&mut self, rng: &mut StdRng, completed_cycle: &mut bool) -> u32 {
        if self.current_parent.is_some() {
            self.group_position = (self.group_position + 1) % self.structure_keys.len();
            if self.group_position == 0 {
                *completed_cycle = true;
            }
        }
        let key = self.structure_keys[self.group_position];
        let members = &self.groups[&key];
        self.queue_position = self.group_position;
        members[recency_weighted_index(members.len(), rng)]
    }

    fn target_children_for(&self, id: u32, cfg: &Config) -> u32 {
        let Some(input) = self.inputs.get(id as usize) else {
            return cfg.children_baseline;
        };
        let ratio = if self.max_coverage == 0 {
            1.0
        } else {
            f64::from(input.nonzero_coverage) / f64::from(self.max_coverage)
        };
        let mut target = (f64::from(cfg.children_baseline) * ratio) as u32;
        if input.is_favored() {
            target *= cfg.favored_multiplier;
        }
        target
    }

    /// Checks that responsibility sets partition cumulative coverage: every
    /// nonzero edge has exactly one owner. Called at cycle boundaries in
    /// single-threaded runs.
    pub(crate) fn check_partition(&self, cumulative_nonzero: u64) -> Result<()> {
        let owned: u64 = self
            .inputs
            .iter()
            .map(|i| i.responsibilities.len() as u64)
            .sum();
        if owned != cumulative_nonzero {
            return Err(GuidanceError::ResponsibilityMismatch {
                owned,
                covered: cumulative_nonzero,
            });
        }
        Ok(())
    }
}

/// Samples an index in `[0, n)` with weight `i + 1` for index `i`.
fn recency_weighted_index(n: usize, rng: &mut StdRng) -> usize {
    let total = n * (n + 1) / 2;
    let mut draw = rng.random_range(0..total) as i64;
    for idx in (0..n).rev() {
        draw -= (idx + 1) as i64;
        if draw < 0 {
            return idx;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn summary(covered: &[EdgeId], new: &[EdgeId]) -> RunSummary {
        RunSummary {
            covered: covered.to_vec(),
            nonzero_count: covered.len() as u32,
            new_vs_cumulative: new.to_vec(),
            new_vs_valid: Vec::new(),
            path_hash: 0xABCD,
            nonzero_hash: 0x1234,
        }
    }

    fn save_input(
        corpus: &mut Corpus,
        bytes: Vec<u8>,
        covered: &[EdgeId],
        new: &[EdgeId],
    ) -> u32 {
        let cfg = Config::default();
        let run = summary(covered, new);
        let resp = corpus.compute_responsibilities(&run, true, bytes.len(), &cfg);
        let mut input = InputRecord::from_seed(bytes);
        input.desc = "test".into();
        corpus
            .save(input, resp, &run, true, Policy::Baseline, None)
            .unwrap()
    }

    #[test]
    fn save_assigns_ids_and_ownership() {
        let mut corpus = Corpus::new();
        let id = save_input(&mut corpus, vec![1, 2, 3], &[10, 11], &[10, 11]);
        assert_eq!(id, 0);
        let saved = corpus.get(id).unwrap();
        assert!(saved.is_favored());
        assert_eq!(saved.responsibilities.len(), 2);
        assert_eq!(saved.nonzero_coverage, 2);
        corpus.check_partition(2).unwrap();
    }

    #[test]
    fn empty_input_is_rejected() {
        let mut corpus = Corpus::new();
        let run = summary(&[1], &[1]);
        let err = corpus
            .save(
                InputRecord::fresh(),
                BTreeSet::new(),
                &run,
                true,
                Policy::Baseline,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, GuidanceError::EmptyInput { .. }));
    }

    #[test]
    fn ownership_transfer_unfavors_old_owner() {
        let mut corpus = Corpus::new();
        let first = save_input(&mut corpus, vec![1], &[10], &[10]);
        // Second input takes over edge 10 (e.g. via stealing) plus a new one.
        let run = summary(&[10, 20], &[20]);
        let mut resp = BTreeSet::new();
        resp.insert(10);
        resp.insert(20);
        let second = corpus
            .save(
                InputRecord::from_seed(vec![2]),
                resp,
                &run,
                true,
                Policy::Baseline,
                None,
            )
            .unwrap();

        assert!(!corpus.get(first).unwrap().is_favored());
        assert_eq!(corpus.get(second).unwrap().responsibilities.len(), 2);
        corpus.check_partition(2).unwrap();
    }

    #[test]
    fn stealing_requires_subsumption_and_smaller_coverage() {
        let cfg = Config {
            steal_responsibility: true,
            ..Config::default()
        };
        let mut corpus = Corpus::new();
        save_input(&mut corpus, vec![1, 2, 3, 4], &[10, 11], &[10, 11]);

        // Superset coverage with more edges: steals.
        let run = summary(&[10, 11, 12], &[12]);
        let resp = corpus.compute_responsibilities(&run, true, 2, &cfg);
        assert_eq!(resp.into_iter().collect::<Vec<_>>(), vec![10, 11, 12]);

        // Equal coverage, smaller byte size: steals.
        let run = summary(&[10, 11], &[]);
        let resp = corpus.compute_responsibilities(&run, true, 2, &cfg);
        assert_eq!(resp.into_iter().collect::<Vec<_>>(), vec![10, 11]);

        // Equal coverage but bigger candidate: no steal.
        let run = summary(&[10, 11], &[]);
        let resp = corpus.compute_responsibilities(&run, true, 100, &cfg);
        assert!(resp.is_empty());
    }

    #[test]
    fn discarded_responsibilities_go_to_current_parent() {
        let mut corpus = Corpus::new();
        let parent = save_input(&mut corpus, vec![1], &[10], &[10]);
        let cfg = Config::default();
        let mut rng = StdRng::seed_from_u64(0);
        corpus.select_parent(&cfg, &mut rng, Policy::Baseline);

        let mut orphaned = BTreeSet::new();
        orphaned.insert(30);
        corpus.transfer_responsibilities(&orphaned);
        assert!(corpus.get(parent).unwrap().responsibilities.contains(&30));
        corpus.check_partition(2).unwrap();
    }

    #[test]
    fn linear_cycling_wraps_and_counts_cycles() {
        let cfg = Config {
            children_baseline: 1,
            favored_multiplier: 1,
            ..Config::default()
        };
        let mut rng = StdRng::seed_from_u64(0);
        let mut corpus = Corpus::new();
        corpus.note_cumulative_nonzero(1);
        save_input(&mut corpus, vec![1], &[10], &[10]);
        save_input(&mut corpus, vec![2], &[11], &[11]);

        let (first, cycled) = corpus.select_parent(&cfg, &mut rng, Policy::Baseline);
        assert_eq!((first, cycled), (0, false));
        let (second, cycled) = corpus.select_parent(&cfg, &mut rng, Policy::Baseline);
        assert_eq!((second, cycled), (1, false));
        let (third, cycled) = corpus.select_parent(&cfg, &mut rng, Policy::Baseline);
        assert_eq!((third, cycled), (0, true));
        assert_eq!(corpus.cycles(), 1);
    }

    #[test]
    fn favored_parent_gets_multiplied_budget() {
        let cfg = Config {
            children_baseline: 3,
            favored_multiplier: 20,
            ..Config::default()
        };
        let mut rng = StdRng::seed_from_u64(0);
        let mut corpus = Corpus::new();
        corpus.note_cumulative_nonzero(2);
        save_input(&mut corpus, vec![1], &[10, 11], &[10, 11]);

        corpus.select_parent(&cfg, &mut rng, Policy::Baseline);
        // ratio 1.0, favored: 3 * 20, one child already booked.
        assert_eq!(corpus.remaining_children(), 59);
    }

    #[test]
    fn recency_weights_prefer_later_indices() {
        let mut rng = StdRng::seed_from_u64(8);
        let mut counts = [0u32; 4];
        for _ in 0..10_000 {
            counts[recency_weighted_index(4, &mut rng)] += 1;
        }
        assert!(counts[3] > counts[2]);
        assert!(counts[2] > counts[1]);
        assert!(counts[1] > counts[0]);
        assert!(counts[0] > 0);
    }

    #[test]
    fn structural_policy_marks_first_exemplar_only() {
        let mut corpus = Corpus::new();
        let cfg = Config::default();

        // Two inputs with the same (empty) structural shape.
        let run = summary(&[10], &[10]);
        let resp = corpus.compute_responsibilities(&run, true, 1, &cfg);
        let first = corpus
            .save(
                InputRecord::from_seed(vec![1]),
                resp,
                &run,
                true,
                Policy::StructuralFeedback,
                None,
            )
            .unwrap();
        let run = summary(&[11], &[11]);
        let resp = corpus.compute_responsibilities(&run, true, 1, &cfg);
        let second = corpus
            .save(
                InputRecord::from_seed(vec![2]),
                resp,
                &run,
                true,
                Policy::StructuralFeedback,
                None,
            )
            .unwrap();

        assert!(corpus.get(first).unwrap().novel_structure);
        assert!(!corpus.get(second).unwrap().novel_structure);
        // The second is still favored through its responsibilities.
        assert!(corpus.get(second).unwrap().is_favored());
    }
}
