//! Time-synchronous beam search over the compiled prefix-tree network.
//!
//! The search keeps one tree instance per language-model context. Each frame
//! the state hypotheses of every instance are expanded through the HMM
//! transitions, scored against the acoustic frame, pruned in several stages,
//! and word ends are collected, recombined and re-entered into the network
//! under their extended contexts.

use std::rc::Rc;

use ordered_float::OrderedFloat;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::lexicon::Lexicon;
use crate::lm::{History, LanguageModel};
use crate::network::{Network, SkipBatch, SuccessorBatch};
use crate::scorer::{AcousticLookahead, AcousticScorer, FrameScorer};
use crate::trace::{traceback, Trace, TraceId, TraceManager, TraceRef, TracebackItem};
use crate::{
    Phoneme, PronId, Score, ScoreVector, StateId, TimeframeIndex, Token, Transit, INVALID_SCORE,
    NO_TRANSIT, TERM_PHONEME,
};

pub mod arena;
pub mod histogram;
pub mod instance;
pub mod lookahead;
pub mod pruning;
pub mod stats;

use arena::{HypothesisArena, StateHypothesis};
use histogram::Histogram;
use instance::{Instance, InstanceId, InstanceKey, InstanceVariant};
use lookahead::{ContextLookahead, LmLookahead};
use pruning::{BeamPruning, PrefixFilter, PruneContext, Pruning, RecordMinimum};
use stats::SearchStatistics;

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("no unique network root for boundary coarticulation ({0}, {1})")]
    NoRootForCoarticulation(Phoneme, Phoneme),
    #[error("the search space is empty, nothing to trace back")]
    EmptySearchSpace,
}

/// How recombined alternatives are retained for lattice output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LatticeMode {
    /// Drop recombined alternatives, keep only the single best path.
    SingleBest,
    /// Thread recombined word ends as trace siblings.
    #[default]
    WordLattice,
    /// Like `WordLattice`, but recombine on a bounded phoneme suffix of the
    /// pronunciation instead of the full LM history.
    Mesh,
}

/// Per-segment boundary conditions and forced word context.
#[derive(Debug, Clone, Default)]
pub struct RecognitionContext {
    /// Words the decoded sequence must start with.
    pub prefix_words: Vec<Token>,
    /// Words appended and LM-scored at the segment end.
    pub suffix_words: Vec<Token>,
    /// Coarticulation carried into the segment start.
    pub initial_transit: Transit,
    /// Required coarticulation at the segment end.
    pub final_transit: Transit,
}

impl RecognitionContext {
    pub fn new() -> Self {
        Self {
            prefix_words: Vec::new(),
            suffix_words: Vec::new(),
            initial_transit: NO_TRANSIT,
            final_transit: NO_TRANSIT,
        }
    }
}

/// Snapshot of the master pruning value plus a health flag, used by outer
/// adaptation loops to tighten or relax the beam between passes.
#[derive(Debug, Clone, Copy)]
pub struct PruningDesc {
    pub beam: Score,
    pub search_space_ok: bool,
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Acoustic beam in LM-scale units.
    pub beam_pruning: Score,
    pub beam_pruning_limit: u32,
    /// Relative to the acoustic beam when <= 1, otherwise in LM-scale units.
    pub word_end_pruning: Score,
    pub word_end_pruning_limit: u32,
    /// Relative to the word-end beam when <= 1. `None` disables the pass.
    pub lm_state_pruning: Option<Score>,
    /// Relative to the word-end beam when <= 1. `None` disables the pass.
    pub word_end_phoneme_pruning: Option<Score>,
    pub early_beam_pruning: bool,
    pub early_word_end_pruning: bool,
    /// Optimistic LM score added while bounding word ends early.
    pub early_word_end_anticipated_lm_score: Score,
    /// Weight of the acoustic share in the pruning prospect.
    pub acoustic_prospect_factor: Score,
    pub histogram_bins: usize,
    /// When set, `set_master_beam` steers the histogram limit instead of the
    /// score beam.
    pub histogram_is_master: bool,

    pub minimum_beam: Score,
    pub maximum_beam: Score,
    pub minimum_beam_limit: u32,
    pub maximum_beam_limit: u32,
    pub minimum_states_after_pruning: f64,
    pub minimum_word_ends_after_pruning: f64,
    pub minimum_word_lemmas_after_recombination: f64,
    pub maximum_states_after_pruning: f64,
    pub maximum_word_ends_after_pruning: f64,
    pub maximum_acoustic_pruning_saturation: f64,

    pub enable_lm_lookahead: bool,
    pub sparse_lookahead: bool,
    /// Delay full-order activation until a hypothesis with a valid prospect
    /// reaches the cutoff depth.
    pub sparse_lookahead_slow_propagation: bool,
    /// Kill sparse misses instead of handing them to the back-off tree, and
    /// feed entering word ends to the back-off tree right away.
    pub early_backoff: bool,
    /// Scales the accumulated back-off penalty added to unigram lookahead
    /// scores. Zero disables the offset.
    pub unigram_lookahead_backoff_factor: Score,
    /// History length the lookahead tables are conditioned on.
    pub lookahead_order: u32,
    pub full_lookahead_min_states: u32,
    pub full_lookahead_dominance: f32,
    /// Only activate the full-order table once a hypothesis lies at this
    /// depth or deeper.
    pub full_lookahead_after_depth: Option<u32>,

    /// Frames an empty instance survives before it is deleted.
    pub instance_deletion_latency: u32,
    /// Key instances by (history, predecessor pronunciation) instead of the
    /// history alone.
    pub condition_on_predecessor_word: bool,
    pub allow_skips: bool,
    pub correct_pushed_boundary_times: bool,
    pub correct_pushed_acoustic_scores: bool,
    /// Compensate clamped negative per-word LM scores on the acoustic side.
    pub overflow_lm_score_to_am: bool,
    /// Scale of the pronunciation weight added to word LM scores.
    pub word_pronunciation_scale: Score,

    pub lattice_mode: LatticeMode,
    /// Phoneme suffix length for mesh recombination; negative means the full
    /// pronunciation.
    pub mesh_history_phones: i32,
    /// Silence lemma whose lattice siblings are dropped after recombination.
    pub optimize_silence_lemma: Option<Token>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            beam_pruning: 12.0,
            beam_pruning_limit: 500_000,
            word_end_pruning: 0.8,
            word_end_pruning_limit: 50_000,
            lm_state_pruning: None,
            word_end_phoneme_pruning: None,
            early_beam_pruning: true,
            early_word_end_pruning: true,
            early_word_end_anticipated_lm_score: 0.0,
            acoustic_prospect_factor: 1.0,
            histogram_bins: 100,
            histogram_is_master: false,
            minimum_beam: 1.0,
            maximum_beam: 40.0,
            minimum_beam_limit: 1_000,
            maximum_beam_limit: 10_000_000,
            minimum_states_after_pruning: 25.0,
            minimum_word_ends_after_pruning: 2.0,
            minimum_word_lemmas_after_recombination: 1.0,
            maximum_states_after_pruning: f64::MAX,
            maximum_word_ends_after_pruning: f64::MAX,
            maximum_acoustic_pruning_saturation: 0.5,
            enable_lm_lookahead: true,
            sparse_lookahead: false,
            sparse_lookahead_slow_propagation: false,
            early_backoff: false,
            unigram_lookahead_backoff_factor: 0.0,
            lookahead_order: 1,
            full_lookahead_min_states: 0,
            full_lookahead_dominance: 0.05,
            full_lookahead_after_depth: None,
            instance_deletion_latency: 3,
            condition_on_predecessor_word: false,
            allow_skips: true,
            correct_pushed_boundary_times: true,
            correct_pushed_acoustic_scores: true,
            overflow_lm_score_to_am: false,
            word_pronunciation_scale: 1.0,
            lattice_mode: LatticeMode::WordLattice,
            mesh_history_phones: 1,
            optimize_silence_lemma: None,
        }
    }
}

/// Effective pruning thresholds, derived from the options and the LM scale
/// and rescaled together through `set_master_beam`.
#[derive(Debug, Clone, Copy)]
struct PruningThresholds {
    acoustic: Score,
    acoustic_limit: u32,
    word_end: Score,
    word_end_limit: u32,
    lm_state: Score,
    word_end_phoneme: Score,
}

impl PruningThresholds {
    fn from_options(options: &SearchOptions, scale: Score) -> Self {
        let acoustic = options.beam_pruning * scale;
        let word_end = if options.word_end_pruning <= 1.0 {
            options.word_end_pruning * acoustic
        } else {
            options.word_end_pruning * scale
        };
        let relative = |value: Option<Score>| match value {
            Some(v) if v <= 1.0 => v * word_end,
            Some(v) => v * scale,
            None => INVALID_SCORE,
        };
        Self {
            acoustic,
            acoustic_limit: options.beam_pruning_limit,
            word_end,
            word_end_limit: options.word_end_pruning_limit,
            lm_state: relative(options.lm_state_pruning),
            word_end_phoneme: relative(options.word_end_phoneme_pruning),
        }
    }
}

/// Word end before the exit is resolved: the bare score split plus the exit
/// id, enough for the absolute pruning pass.
#[derive(Debug, Clone, Copy)]
struct EarlyWordEndHypothesis {
    trace: TraceId,
    score: ScoreVector,
    exit: u32,
}

/// A completed word: extended LM context, re-entry state, and the trace that
/// will become the predecessor of everything following it.
#[derive(Debug, Clone)]
pub struct WordEndHypothesis {
    pub history: History,
    pub lookahead_history: History,
    pub transit_state: StateId,
    pub pronunciation: Option<PronId>,
    pub score: ScoreVector,
    pub trace: TraceRef,
}

pub struct SearchSpace {
    network: Rc<Network>,
    lexicon: Rc<Lexicon>,
    lm: Rc<dyn LanguageModel>,
    options: SearchOptions,

    arena: HypothesisArena,
    slots: Vec<Option<Instance>>,
    active: Vec<InstanceId>,
    instance_map: FxHashMap<InstanceKey, InstanceId>,
    traces: TraceManager,

    lookahead: Option<LmLookahead>,
    unigram: Option<Rc<ContextLookahead>>,
    full_lookahead_after_id: Option<u32>,
    current_lookahead_state_threshold: u32,
    acoustic_lookahead: Option<Box<dyn AcousticLookahead>>,

    pruning: PruningThresholds,
    state_histogram: Histogram,
    word_end_histogram: Histogram,

    early_word_ends: Vec<EarlyWordEndHypothesis>,
    word_ends: Vec<WordEndHypothesis>,

    context: RecognitionContext,

    global_score_offset: Score,
    best_prospect: Score,
    best_score: Score,
    min_word_end_score: Score,
    had_word_end: bool,
    acoustic_saturated: bool,
    time_frame: TimeframeIndex,

    stats: SearchStatistics,
}

impl SearchSpace {
    pub fn new(
        network: Rc<Network>,
        lexicon: Rc<Lexicon>,
        lm: Rc<dyn LanguageModel>,
        options: SearchOptions,
    ) -> Self {
        let n_states = network.n_states();
        let (lookahead, unigram, full_lookahead_after_id) = if options.enable_lm_lookahead {
            let mut la = LmLookahead::new(&network, &lexicon);
            let unigram_history = lm.reduced_history(lm.start_history(), 0);
            let table = la.get_lookahead(lm.as_ref(), unigram_history, false);
            let after = options
                .full_lookahead_after_depth
                .and_then(|depth| la.last_node_on_depth(depth));
            (Some(la), Some(table), after)
        } else {
            (None, None, None)
        };
        let pruning = PruningThresholds::from_options(&options, lm.scale());
        let histogram_bins = options.histogram_bins;
        Self {
            network,
            lexicon,
            lm,
            options,
            arena: HypothesisArena::new(n_states),
            slots: Vec::new(),
            active: Vec::new(),
            instance_map: FxHashMap::default(),
            traces: TraceManager::new(),
            lookahead,
            unigram,
            full_lookahead_after_id,
            current_lookahead_state_threshold: 0,
            acoustic_lookahead: None,
            pruning,
            state_histogram: Histogram::new(histogram_bins),
            word_end_histogram: Histogram::new(histogram_bins),
            early_word_ends: Vec::new(),
            word_ends: Vec::new(),
            context: RecognitionContext::new(),
            global_score_offset: 0.0,
            best_prospect: INVALID_SCORE,
            best_score: INVALID_SCORE,
            min_word_end_score: INVALID_SCORE,
            had_word_end: false,
            acoustic_saturated: false,
            time_frame: 0,
            stats: SearchStatistics::new(),
        }
    }

    pub fn options(&self) -> &SearchOptions {
        &self.options
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn lexicon(&self) -> &Lexicon {
        &self.lexicon
    }

    pub fn statistics(&self) -> &SearchStatistics {
        &self.stats
    }

    pub fn n_state_hypotheses(&self) -> usize {
        self.arena.current.len()
    }

    pub fn n_word_end_hypotheses(&self) -> usize {
        self.word_ends.len()
    }

    pub fn n_active_instances(&self) -> usize {
        self.active.len()
    }

    pub fn best_score(&self) -> Score {
        self.best_score
    }

    pub fn had_word_end(&self) -> bool {
        self.had_word_end
    }

    pub fn set_acoustic_lookahead(&mut self, lookahead: Box<dyn AcousticLookahead>) {
        self.acoustic_lookahead = Some(lookahead);
    }

    /// Reset all per-segment state. Pruning thresholds and the compiled
    /// lookahead structure survive; cached context tables are dropped.
    pub fn clear(&mut self) {
        self.arena.clear();
        self.slots.clear();
        self.active.clear();
        self.instance_map.clear();
        self.traces.clear();
        self.early_word_ends.clear();
        self.word_ends.clear();
        self.global_score_offset = 0.0;
        self.best_prospect = INVALID_SCORE;
        self.best_score = INVALID_SCORE;
        self.min_word_end_score = INVALID_SCORE;
        self.had_word_end = false;
        self.acoustic_saturated = false;
        self.time_frame = 0;
        self.current_lookahead_state_threshold = 0;
        self.stats.clear();
        if let Some(la) = &mut self.lookahead {
            la.clear_tables();
        }
    }

    pub fn set_context(&mut self, context: RecognitionContext) {
        self.context = context;
    }

    pub fn set_current_time_frame(&mut self, time: TimeframeIndex) {
        self.time_frame = time;
    }

    fn inst(&self, id: InstanceId) -> &Instance {
        match &self.slots[id.index()] {
            Some(instance) => instance,
            None => unreachable!("instance was deactivated"),
        }
    }

    fn inst_mut(&mut self, id: InstanceId) -> &mut Instance {
        match &mut self.slots[id.index()] {
            Some(instance) => instance,
            None => unreachable!("instance was deactivated"),
        }
    }

    fn push_instance(
        &mut self,
        key: InstanceKey,
        variant: InstanceVariant,
        history: History,
    ) -> InstanceId {
        let id = InstanceId(self.slots.len() as u32);
        self.slots.push(Some(Instance::new(id, key, variant, history)));
        self.active.push(id);
        id
    }

    fn instance_for_key(&mut self, key: InstanceKey, lookahead_history: History) -> InstanceId {
        if let Some(&id) = self.instance_map.get(&key) {
            return id;
        }
        let id = self.push_instance(key, InstanceVariant::Root, key.history);
        self.inst_mut(id).lookahead_history = Some(lookahead_history);
        self.instance_map.insert(key, id);
        id
    }

    /// The back-off tree of an instance, created on first use. Back-off
    /// children share the parent's key and full history but look ahead with
    /// the context shortened by one word. They are not registered in the
    /// key map.
    fn get_back_off_instance(&mut self, id: InstanceId) -> Option<InstanceId> {
        if let Some(child) = self.inst(id).back_off_child {
            return Some(child);
        }
        self.lookahead.as_ref()?;
        if !self.lm.is_backing_off() {
            return None;
        }
        let (key, full_history, history) = {
            let parent = self.inst(id);
            (
                parent.key,
                parent.history,
                parent.lookahead_history.unwrap_or(parent.history),
            )
        };
        let length = self.lm.history_length(history);
        if length == 0 {
            return None;
        }
        let reduced = self.lm.reduced_history(history, length - 1);
        let back_off_score = self.lm.back_off_score(history);
        let child = self.push_instance(key, InstanceVariant::BackOff { parent: id }, full_history);
        self.inst_mut(child).lookahead_history = Some(reduced);
        let parent = self.inst_mut(id);
        parent.back_off_child = Some(child);
        parent.back_off_score = back_off_score;
        Some(child)
    }

    /// Remove the instance once it has been empty for longer than the
    /// deletion latency. Links to and from its back-off relatives are
    /// severed before the slot is freed.
    fn eventually_deactivate(&mut self, id: InstanceId, increase_inactive: bool) -> bool {
        let latency = self.options.instance_deletion_latency;
        {
            let instance = self.inst_mut(id);
            if !instance.may_deactivate() {
                instance.inactive = 0;
                return false;
            }
            if instance.inactive < latency {
                if increase_inactive {
                    instance.inactive += 1;
                }
                return false;
            }
        }
        let (key, variant, child) = {
            let instance = self.inst(id);
            (instance.key, instance.variant, instance.back_off_child)
        };
        if self.instance_map.get(&key) == Some(&id) {
            self.instance_map.remove(&key);
        }
        if let InstanceVariant::BackOff { parent } = variant {
            if let Some(parent) = self.slots[parent.index()].as_mut() {
                if parent.back_off_child == Some(id) {
                    parent.back_off_child = None;
                }
            }
        }
        if let Some(child) = child {
            if let Some(child) = self.slots[child.index()].as_mut() {
                child.variant = InstanceVariant::Root;
            }
        }
        self.slots[id.index()] = None;
        true
    }

    // ----- expansion ------------------------------------------------------

    fn expand_state(
        network: &Network,
        arena: &mut HypothesisArena,
        hyp: &StateHypothesis,
        allow_skips: bool,
    ) {
        let tm = network.transition_model(hyp.state);
        let loop_score = hyp.score + tm.loop_;
        if loop_score < INVALID_SCORE {
            arena.activate_or_update_loop(hyp, loop_score);
        }
        let forward_score = hyp.score + tm.forward;
        if forward_score < INVALID_SCORE {
            match network.batch(hyp.state) {
                SuccessorBatch::Range(begin, end) => {
                    for successor in begin..end {
                        arena.activate_or_update_transition(hyp, forward_score, successor);
                    }
                }
                SuccessorBatch::Irregular => {
                    for &successor in network.successors(hyp.state) {
                        arena.activate_or_update_transition(hyp, forward_score, successor);
                    }
                }
            }
        }
        if allow_skips {
            let skip_score = hyp.score + tm.skip;
            if skip_score < INVALID_SCORE {
                match network.skip_batch(hyp.state) {
                    SkipBatch::Forbidden => {}
                    SkipBatch::Range(begin, end) => {
                        for successor in begin..end {
                            arena.activate_or_update_transition(hyp, skip_score, successor);
                        }
                    }
                    SkipBatch::Irregular => {
                        for &successor in network.skip_successors(hyp.state) {
                            arena.activate_or_update_transition(hyp, skip_score, successor);
                        }
                    }
                }
            }
        }
    }

    /// Expand every instance into the next frame's buffer and attach the
    /// lookahead prospects. Back-off instances created along the way are
    /// expanded within the same pass.
    pub fn expand_hmm(&mut self) {
        self.best_prospect = INVALID_SCORE;
        self.best_score = INVALID_SCORE;
        let allow_skips = self.options.allow_skips;
        let early_backoff = self.options.early_backoff;

        let mut index = 0;
        while index < self.active.len() {
            let id = self.active[index];
            index += 1;

            self.arena.begin_instance();
            let new_begin = self.arena.next.len() as u32;

            let (old_begin, old_end, mut roots) = {
                let instance = self.inst_mut(id);
                (
                    instance.states_begin,
                    instance.states_end,
                    std::mem::take(&mut instance.root_state_hypotheses),
                )
            };

            for hyp in &roots {
                Self::expand_state(&self.network, &mut self.arena, hyp, allow_skips);
            }
            if early_backoff && !roots.is_empty() {
                if let Some(child) = self.get_back_off_instance(id) {
                    let offset = self.inst(id).back_off_score;
                    for hyp in &mut roots {
                        hyp.score += offset;
                        hyp.prospect = hyp.score;
                    }
                    self.inst_mut(child).root_state_hypotheses.extend(roots);
                }
            }

            for i in old_begin..old_end {
                let hyp = self.arena.current[i as usize];
                Self::expand_state(&self.network, &mut self.arena, &hyp, allow_skips);
            }

            let transfer = std::mem::take(&mut self.inst_mut(id).transfer);
            for &t in &transfer {
                let hyp = self.arena.next[t as usize];
                self.arena.activate_or_update_direct(&hyp);
            }

            {
                let end = self.arena.next.len() as u32;
                let instance = self.inst_mut(id);
                instance.states_begin = new_begin;
                instance.states_end = end;
            }
            self.apply_lookahead_in_instance(id);
        }

        self.arena.swap();
        let dominance =
            (self.options.full_lookahead_dominance * self.arena.current.len() as f32) as u32;
        self.current_lookahead_state_threshold =
            self.options.full_lookahead_min_states.max(dominance);
    }

    fn merge_minimum(&mut self, record: &RecordMinimum) {
        if record.best_prospect < self.best_prospect {
            self.best_prospect = record.best_prospect;
            self.best_score = record.best_score;
        }
    }

    fn back_off_chain_states(&self, id: InstanceId) -> u32 {
        let mut total = 0;
        let mut current = Some(id);
        while let Some(c) = current {
            let instance = self.inst(c);
            total += instance.n_states();
            current = instance.back_off_child;
        }
        total
    }

    /// Attach a lookahead table to the instance. `compute` forces table
    /// construction; otherwise only a cached table is picked up.
    fn activate_lookahead(&mut self, id: InstanceId, compute: bool) {
        if self.inst(id).lookahead.is_some() {
            return;
        }
        if let InstanceVariant::BackOff { parent } = self.inst(id).variant {
            let offset = match &self.slots[parent.index()] {
                Some(parent) => parent.total_back_off_offset + parent.back_off_score,
                None => 0.0,
            };
            self.inst_mut(id).total_back_off_offset = offset;
        }
        let history = {
            let instance = self.inst(id);
            instance.lookahead_history.unwrap_or(instance.history)
        };
        let table = if Some(history) == self.unigram.as_ref().map(|t| t.history) {
            self.unigram.clone()
        } else if compute {
            let sparse = self.options.sparse_lookahead;
            match self.lookahead.as_mut() {
                Some(la) => Some(la.get_lookahead(self.lm.as_ref(), history, sparse)),
                None => None,
            }
        } else {
            self.lookahead
                .as_ref()
                .and_then(|la| la.try_get_lookahead(history))
        };
        if let Some(table) = table {
            self.inst_mut(id).lookahead = Some(table);
        }
    }

    /// Compute the pruning prospects of the instance's fresh hypotheses.
    /// Without a full-order table the unigram table plus back-off offset is
    /// used until the instance grows past the activation threshold. Sparse
    /// misses are handed to the back-off tree.
    fn apply_lookahead_in_instance(&mut self, id: InstanceId) {
        let (begin, end) = {
            let instance = self.inst(id);
            (instance.states_begin as usize, instance.states_end as usize)
        };
        if begin == end {
            return;
        }
        let mut record = RecordMinimum::default();

        if self.lookahead.is_none() {
            for sh in &mut self.arena.next[begin..end] {
                sh.prospect = sh.score;
                record.prepare(sh);
            }
            self.merge_minimum(&record);
            return;
        }

        self.activate_lookahead(id, false);

        let mut back_off_offset = 0.0;
        let mut start = begin;
        if self.inst(id).lookahead.is_none() {
            let history = {
                let instance = self.inst(id);
                instance.lookahead_history.unwrap_or(instance.history)
            };
            if self.options.unigram_lookahead_backoff_factor != 0.0 {
                back_off_offset = self.lm.accumulated_back_off_score(history, 1)
                    * self.options.unigram_lookahead_backoff_factor;
            }
            let combined = if self.options.sparse_lookahead {
                self.back_off_chain_states(id)
            } else {
                (end - begin) as u32
            };
            if combined >= self.current_lookahead_state_threshold {
                let mut activate = true;
                if let Some(after) = self.full_lookahead_after_id {
                    activate = false;
                    let slow = self.options.sparse_lookahead_slow_propagation;
                    if let (Some(la), Some(unigram)) = (&self.lookahead, &self.unigram) {
                        while start < end {
                            let sh = &mut self.arena.next[start];
                            let node = la.node_of(sh.state);
                            if node <= after && (!slow || sh.prospect != INVALID_SCORE) {
                                activate = true;
                                break;
                            }
                            match unigram.score(node) {
                                Some(lm_score) => {
                                    sh.prospect = sh.score + lm_score + back_off_offset;
                                    record.prepare(sh);
                                }
                                None => sh.prospect = INVALID_SCORE,
                            }
                            start += 1;
                        }
                    }
                }
                if activate {
                    self.activate_lookahead(id, true);
                }
            }
        }

        let table = match self.inst(id).lookahead.clone() {
            Some(table) => {
                back_off_offset = 0.0;
                table
            }
            None => match self.unigram.clone() {
                Some(table) => table,
                None => return,
            },
        };

        if table.is_sparse() {
            if self.inst(id).back_off_child.is_none() {
                self.get_back_off_instance(id);
            }
            let child = self.inst(id).back_off_child;
            let offset = self.inst(id).back_off_score;
            let early = self.options.early_backoff;
            let mut transfers: Vec<u32> = Vec::new();
            if let Some(la) = &self.lookahead {
                for i in start..end {
                    let sh = &mut self.arena.next[i];
                    match table.score(la.node_of(sh.state)) {
                        Some(lm_score) => {
                            sh.prospect = sh.score + lm_score;
                            record.prepare(sh);
                        }
                        None => {
                            sh.prospect = INVALID_SCORE;
                            if early || child.is_none() {
                                sh.score = INVALID_SCORE;
                            } else {
                                sh.score += offset;
                                transfers.push(i as u32);
                            }
                        }
                    }
                }
            }
            if let Some(child) = child {
                if !transfers.is_empty() {
                    self.inst_mut(child).transfer.extend(transfers);
                }
            }
        } else if let Some(la) = &self.lookahead {
            for i in start..end {
                let sh = &mut self.arena.next[i];
                match table.score(la.node_of(sh.state)) {
                    Some(lm_score) => {
                        sh.prospect = sh.score + lm_score + back_off_offset;
                        record.prepare(sh);
                    }
                    None => sh.prospect = INVALID_SCORE,
                }
            }
        }
        self.merge_minimum(&record);
    }

    // ----- pruning --------------------------------------------------------

    /// Compact the current buffer through `pruning`, instance by instance,
    /// and drop instances that stayed empty past the deletion latency.
    fn prune_states<P: Pruning>(&mut self, pruning: &mut P, increase_inactive: bool) {
        let order = std::mem::take(&mut self.active);
        let mut kept = Vec::with_capacity(order.len());
        let mut out = 0u32;
        for id in order {
            let (begin, end) = {
                let instance = self.inst(id);
                (instance.states_begin, instance.states_end)
            };
            let new_begin = out;
            {
                let ctx = PruneContext {
                    traces: &self.traces,
                    lexicon: self.lexicon.as_ref(),
                };
                let current = &mut self.arena.current;
                for i in begin..end {
                    let hyp = current[i as usize];
                    if !pruning.prune(&ctx, &hyp) {
                        current[out as usize] = hyp;
                        out += 1;
                    }
                }
            }
            {
                let instance = self.inst_mut(id);
                instance.states_begin = new_begin;
                instance.states_end = out;
            }
            if !self.eventually_deactivate(id, increase_inactive) {
                kept.push(id);
            }
        }
        self.arena.current.truncate(out as usize);
        self.active = kept;
    }

    fn add_acoustic_scores(&mut self, scorer: &dyn AcousticScorer) {
        let mut record = RecordMinimum::default();
        let factor = self.options.acoustic_prospect_factor;
        let network = self.network.as_ref();
        let acoustic_lookahead = self
            .acoustic_lookahead
            .as_deref()
            .filter(|a| a.is_enabled());
        for sh in &mut self.arena.current {
            if sh.prospect == INVALID_SCORE {
                continue;
            }
            let mixture = network.state(sh.state).mixture;
            let score = scorer.score(mixture);
            sh.score += score;
            sh.prospect += score * factor;
            if let Some(ala) = acoustic_lookahead {
                sh.prospect += ala.score_for_state(sh.state, mixture);
            }
            record.prepare(sh);
        }
        self.best_prospect = record.best_prospect;
        self.best_score = record.best_score;
    }

    fn quantile_state_score(&mut self, min: Score, max: Score, n: u32) -> Score {
        self.state_histogram.clear();
        self.state_histogram.set_limits(min, max);
        let histogram = &mut self.state_histogram;
        for sh in &self.arena.current {
            if sh.prospect != INVALID_SCORE {
                histogram.add(sh.prospect);
            }
        }
        histogram.quantile(n)
    }

    /// Keep, per network state, the best hypothesis across all instances and
    /// only those competitors within the LM-state beam of it. The
    /// recombination array is reused with an offset encoding over the
    /// current buffer so stale entries are recognizable.
    fn prune_states_per_lm_state(&mut self) {
        let threshold = self.pruning.lm_state;
        if !(threshold < self.pruning.acoustic) {
            return;
        }
        let order = std::mem::take(&mut self.active);
        let ranges: Vec<(u32, u32)> = order
            .iter()
            .map(|&id| {
                let instance = self.inst(id);
                (instance.states_begin, instance.states_end)
            })
            .collect();
        let mut new_ranges = Vec::with_capacity(order.len());
        {
            let (recombination, current) = self.arena.recombination_mut();
            let size = current.len() as u32;
            for a in 0..size {
                let state = current[a as usize].state as usize;
                let corrected = recombination[state].wrapping_sub(size);
                if corrected >= size
                    || current[corrected as usize].state != current[a as usize].state
                    || current[corrected as usize].prospect > current[a as usize].prospect
                {
                    recombination[state] = size + a;
                }
            }
            let mut out = 0u32;
            for &(begin, end) in &ranges {
                let new_begin = out;
                for i in begin..end {
                    let hyp = current[i as usize];
                    let best = recombination[hyp.state as usize].wrapping_sub(size);
                    let keep = if best == i {
                        // The best hypothesis of a state is always kept and
                        // its entry follows it to the compacted position.
                        recombination[hyp.state as usize] = size + out;
                        true
                    } else {
                        hyp.prospect <= current[best as usize].prospect + threshold
                    };
                    if keep {
                        current[out as usize] = hyp;
                        out += 1;
                    }
                }
                new_ranges.push((new_begin, out));
            }
            current.truncate(out as usize);
        }
        let mut kept = Vec::with_capacity(order.len());
        for (id, (begin, end)) in order.into_iter().zip(new_ranges) {
            {
                let instance = self.inst_mut(id);
                instance.states_begin = begin;
                instance.states_end = end;
            }
            if !self.eventually_deactivate(id, false) {
                kept.push(id);
            }
        }
        self.active = kept;
    }

    /// Re-attach word boundary corrections for hypotheses inside the pushed
    /// fan-out of a minimized network: their trace still carries the
    /// boundary of the previous word, off by the frames spent before the
    /// root level.
    fn correct_pushed_transitions(&mut self, scorer: &dyn AcousticScorer) {
        if !self.options.correct_pushed_boundary_times || self.network.root_depth() == 0 {
            return;
        }
        let root_depth = self.network.root_depth();
        let correct_scores = self.options.correct_pushed_acoustic_scores;
        let time = self.time_frame;
        let offset = self.global_score_offset;
        for i in 0..self.arena.current.len() {
            let hyp = self.arena.current[i];
            let depth = self.network.depth(hyp.state);
            if depth == root_depth {
                // Still at the root level: re-derive the correction from the
                // unmodified base every frame.
                let base = self.traces.unmodified(hyp.trace);
                let (trace_time, trace_total) = {
                    let t = self.traces.trace_item(base).trace.borrow();
                    (t.time, t.score.total())
                };
                let time_diff = (1 + time as i64 - trace_time as i64) as i32;
                let score_diff = if correct_scores {
                    hyp.score + offset - trace_total
                } else {
                    0.0
                };
                self.arena.current[i].trace =
                    self.traces.modify(base, time_diff, score_diff, hyp.state);
            } else if depth > root_depth && !self.traces.is_modified(hyp.trace) {
                let (trace_time, trace_total) = {
                    let t = self.traces.trace_item(hyp.trace).trace.borrow();
                    (t.time, t.score.total())
                };
                if time < trace_time {
                    continue;
                }
                let time_diff = (time - trace_time) as i32;
                let score_diff = if correct_scores && time_diff > 0 {
                    hyp.score + offset
                        - scorer.score(self.network.state(hyp.state).mixture)
                        - trace_total
                } else {
                    0.0
                };
                self.arena.current[i].trace =
                    self.traces.modify(hyp.trace, time_diff, score_diff, hyp.state);
            }
        }
    }

    /// The full pruning cascade for one frame: prefix filter, early beam,
    /// acoustic scoring, main beam, per-LM-state pruning, histogram limit,
    /// and pushed-boundary correction.
    pub fn prune_and_add_scores(&mut self, scorer: &dyn AcousticScorer) {
        self.acoustic_saturated = false;
        if !self.context.prefix_words.is_empty() {
            let mut filter = PrefixFilter::new(self.context.prefix_words.clone());
            self.prune_states(&mut filter, false);
        }
        if self.options.early_beam_pruning {
            let mut pruning = BeamPruning::new(self.pruning.acoustic);
            pruning.minimum.best_prospect = self.best_prospect;
            pruning.minimum.best_score = self.best_score;
            self.prune_states(&mut pruning, false);
        }
        self.add_acoustic_scores(scorer);
        {
            let mut pruning = BeamPruning::new(self.pruning.acoustic);
            pruning.minimum.best_prospect = self.best_prospect;
            pruning.minimum.best_score = self.best_score;
            self.prune_states(&mut pruning, true);
        }
        self.prune_states_per_lm_state();
        let limit = self.pruning.acoustic_limit;
        if self.arena.current.len() as u32 > limit {
            let threshold = self.quantile_state_score(
                self.best_prospect,
                self.best_prospect + self.pruning.acoustic,
                limit,
            );
            let mut pruning = BeamPruning::new(threshold - self.best_prospect);
            pruning.minimum.best_prospect = self.best_prospect;
            self.prune_states(&mut pruning, false);
            self.acoustic_saturated = true;
        }
        self.correct_pushed_transitions(scorer);
    }

    // ----- word ends ------------------------------------------------------

    /// Collect exits of all surviving hypotheses into early word-end
    /// hypotheses, tracking the running minimum for the relative bound.
    pub fn find_word_ends(&mut self) {
        let relative = self.pruning.acoustic.min(self.pruning.word_end);
        let early = self.options.early_word_end_pruning;
        let anticipated = self.options.early_word_end_anticipated_lm_score;
        let pron_scale = self.options.word_pronunciation_scale;
        let mut best_bound = INVALID_SCORE;
        let mut min_score = INVALID_SCORE;
        let mut found: Vec<EarlyWordEndHypothesis> = Vec::new();

        let order = self.active.clone();
        for id in order {
            let instance = match &mut self.slots[id.index()] {
                Some(instance) => instance,
                None => continue,
            };
            let (begin, end) = (instance.states_begin, instance.states_end);
            let back_off_offset = instance.total_back_off_offset;
            for h in begin..end {
                let hyp = self.arena.current[h as usize];
                if !self.network.has_exits(hyp.state) {
                    continue;
                }
                let exit_penalty = self.network.transition_model(hyp.state).exit;
                if early && hyp.score + exit_penalty + anticipated > best_bound {
                    continue;
                }
                let trace_lm = self.traces.trace_item(hyp.trace).trace.borrow().score.lm;
                for exit_id in self.network.exits_of(hyp.state) {
                    let exit = *self.network.exit(exit_id);
                    let mut score =
                        ScoreVector::new(hyp.score - trace_lm - back_off_offset, trace_lm);
                    score.acoustic += exit_penalty;
                    if let Some(pron) = exit.pronunciation {
                        score.lm += instance.add_lm_score(
                            self.lm.as_ref(),
                            self.lexicon.as_ref(),
                            pron,
                            pron_scale,
                        );
                    }
                    let total = score.total();
                    if total < min_score {
                        min_score = total;
                        best_bound = total + relative;
                    }
                    if total > best_bound {
                        continue;
                    }
                    found.push(EarlyWordEndHypothesis {
                        trace: hyp.trace,
                        score,
                        exit: exit_id,
                    });
                }
            }
        }
        self.min_word_end_score = min_score;
        self.early_word_ends = found;
    }

    /// The trace of a hypothesis with its pushed-boundary correction
    /// materialized as an epsilon trace item.
    fn modified_trace(&self, id: TraceId) -> TraceRef {
        let trace = self.traces.trace_item(id).trace.clone();
        if let Some(m) = self.traces.modification(id) {
            if m.time_offset != 0 || m.acoustic_offset != 0.0 {
                let (time, mut score) = {
                    let t = trace.borrow();
                    (t.time as i64 + m.time_offset as i64, t.score)
                };
                let time = time.clamp(0, self.time_frame as i64) as TimeframeIndex;
                score.acoustic += m.acoustic_offset;
                let transit = self.network.transit_description(m.state);
                return Trace::extend(trace, None, time, score, transit);
            }
        }
        trace
    }

    /// Absolute word-end pruning, exit resolution, per-phoneme pruning and
    /// the histogram limit.
    pub fn prune_early_word_ends(&mut self) {
        let threshold =
            self.min_word_end_score + self.pruning.acoustic.min(self.pruning.word_end);
        let early = std::mem::take(&mut self.early_word_ends);
        for weh in &early {
            if weh.score.total() > threshold {
                continue;
            }
            let exit = *self.network.exit(weh.exit);
            let (history, lookahead_history) = {
                let item = self.traces.trace_item(weh.trace);
                (item.history, item.lookahead_history)
            };
            let trace = self.modified_trace(weh.trace);
            let mut hypothesis = WordEndHypothesis {
                history,
                lookahead_history,
                transit_state: exit.transit_state,
                pronunciation: exit.pronunciation,
                score: weh.score,
                trace,
            };
            if let Some(pron) = exit.pronunciation {
                let lemma = self.lexicon.pronunciation(pron).lemma;
                hypothesis.history = self.lm.extended_history(history, lemma);
                hypothesis.lookahead_history =
                    self.lm.extended_history(lookahead_history, lemma);
            }
            self.word_ends.push(hypothesis);
        }
        self.prune_word_end_phonemes();
        let limit = self.pruning.word_end_limit;
        if self.word_ends.len() as u32 > limit {
            let threshold = self.quantile_word_end_score(
                self.min_word_end_score,
                self.min_word_end_score + self.pruning.word_end,
                limit,
            );
            self.word_ends.retain(|w| w.score.total() <= threshold);
        }
    }

    /// Separate pruning per initial phoneme of the following word, so one
    /// dominant fan-out branch cannot starve the others. Pushed boundaries
    /// have no resolved phoneme yet and are never pruned here.
    fn prune_word_end_phonemes(&mut self) {
        let phoneme_beam = self.pruning.word_end_phoneme;
        if !(phoneme_beam < self.pruning.word_end) {
            return;
        }
        let network = self.network.clone();
        let root_depth = network.root_depth();
        let group = |w: &WordEndHypothesis| -> Phoneme {
            if network.depth(w.transit_state) < root_depth {
                TERM_PHONEME
            } else {
                network.transit_description(w.transit_state).1
            }
        };
        let mut minima: FxHashMap<Phoneme, Score> = FxHashMap::default();
        for w in &self.word_ends {
            let entry = minima.entry(group(w)).or_insert(INVALID_SCORE);
            if w.score.total() < *entry {
                *entry = w.score.total();
            }
        }
        self.word_ends.retain(|w| {
            let g = group(w);
            if g == TERM_PHONEME {
                return true;
            }
            w.score.total() < minima[&g] + phoneme_beam
        });
    }

    fn quantile_word_end_score(&mut self, min: Score, max: Score, n: u32) -> Score {
        self.word_end_histogram.clear();
        self.word_end_histogram.set_limits(min, max);
        let histogram = &mut self.word_end_histogram;
        for w in &self.word_ends {
            histogram.add(w.score.total());
        }
        histogram.quantile(n)
    }

    /// Append one trace node per surviving word end. The word boundary gets
    /// time `time` (one past the current frame). Negative per-word LM
    /// scores are clamped against the predecessor.
    pub fn create_traces(&mut self, time: TimeframeIndex) {
        let offset = self.global_score_offset;
        let overflow = self.options.overflow_lm_score_to_am;
        for weh in &mut self.word_ends {
            if weh.pronunciation.is_none() {
                continue;
            }
            let transit = self.network.transit_description(weh.transit_state);
            let predecessor_score = weh.trace.borrow().score;
            let trace = Trace::extend(weh.trace.clone(), weh.pronunciation, time, weh.score, transit);
            {
                let mut t = trace.borrow_mut();
                t.score.acoustic += offset;
                if t.score.lm < predecessor_score.lm {
                    let own = t.score.lm;
                    weh.score.lm = predecessor_score.lm;
                    t.score.lm = predecessor_score.lm;
                    if overflow {
                        let diff = predecessor_score.lm - own;
                        if diff < weh.score.acoustic {
                            t.score.acoustic -= diff;
                            weh.score.acoustic -= diff;
                            if t.score.acoustic < predecessor_score.acoustic {
                                t.score.acoustic = predecessor_score.acoustic;
                                weh.score.acoustic = t.score.acoustic - offset;
                            }
                        }
                    }
                }
            }
            weh.trace = trace;
        }
    }

    /// Chain zero-length pronunciations onto the word ends of this frame.
    /// Only the word ends present at entry are considered, so epsilon
    /// chains stay single-level per frame.
    pub fn hypothesize_epsilon_pronunciations(&mut self) {
        let n = self.word_ends.len();
        let threshold = self.min_word_end_score + self.pruning.word_end;
        let pron_scale = self.options.word_pronunciation_scale;
        for w in 0..n {
            let base = self.word_ends[w].clone();
            for exit_id in self.network.exits_of(base.transit_state) {
                let exit = *self.network.exit(exit_id);
                let pron = match exit.pronunciation {
                    Some(pron) => pron,
                    None => continue,
                };
                let mut weh = base.clone();
                weh.pronunciation = Some(pron);
                weh.transit_state = exit.transit_state;
                let key = InstanceKey {
                    history: weh.history,
                    predecessor: None,
                };
                let lm_score = match self.instance_map.get(&key).copied() {
                    Some(id) => match &mut self.slots[id.index()] {
                        Some(instance) => instance.add_lm_score(
                            self.lm.as_ref(),
                            self.lexicon.as_ref(),
                            pron,
                            pron_scale,
                        ),
                        None => self.lm.pronunciation_score(
                            weh.history,
                            self.lexicon.pronunciation(pron),
                            pron_scale,
                        ),
                    },
                    None => self.lm.pronunciation_score(
                        weh.history,
                        self.lexicon.pronunciation(pron),
                        pron_scale,
                    ),
                };
                weh.score.lm += lm_score;
                weh.score.acoustic += self.network.transition_model(base.transit_state).exit;
                if weh.score.total() > threshold {
                    continue;
                }
                let lemma = self.lexicon.pronunciation(pron).lemma;
                weh.history = self.lm.extended_history(weh.history, lemma);
                weh.lookahead_history = self.lm.extended_history(weh.lookahead_history, lemma);
                let boundary_time = weh.trace.borrow().time;
                let trace = Trace::extend(
                    weh.trace.clone(),
                    Some(pron),
                    boundary_time,
                    weh.score,
                    self.network.transit_description(exit.transit_state),
                );
                trace.borrow_mut().score.acoustic += self.global_score_offset;
                weh.trace = trace;
                self.word_ends.push(weh);
            }
        }
    }

    /// Recombine word ends that continue identically: same LM context and
    /// re-entry state, or in mesh mode same re-entry state and pronunciation
    /// suffix. The better path survives; in lattice modes the loser is
    /// threaded as a sibling.
    pub fn recombine_word_ends(&mut self) {
        let lattice = self.options.lattice_mode != LatticeMode::SingleBest;
        let mesh = self.options.lattice_mode == LatticeMode::Mesh;
        let incoming = std::mem::take(&mut self.word_ends);
        let mut out: Vec<WordEndHypothesis> = Vec::with_capacity(incoming.len());
        if mesh {
            let phones = self.options.mesh_history_phones;
            let mut map: FxHashMap<(StateId, Vec<Phoneme>), usize> = FxHashMap::default();
            for weh in incoming {
                let suffix: Vec<Phoneme> = weh
                    .pronunciation
                    .map(|p| self.lexicon.pronunciation(p).phoneme_suffix(phones).to_vec())
                    .unwrap_or_default();
                match map.entry((weh.transit_state, suffix)) {
                    std::collections::hash_map::Entry::Occupied(entry) => {
                        recombine_two(weh, &mut out[*entry.get()], lattice);
                    }
                    std::collections::hash_map::Entry::Vacant(entry) => {
                        entry.insert(out.len());
                        out.push(weh);
                    }
                }
            }
        } else {
            let mut map: FxHashMap<(History, StateId), usize> = FxHashMap::default();
            for weh in incoming {
                match map.entry((weh.history, weh.transit_state)) {
                    std::collections::hash_map::Entry::Occupied(entry) => {
                        recombine_two(weh, &mut out[*entry.get()], lattice);
                    }
                    std::collections::hash_map::Entry::Vacant(entry) => {
                        entry.insert(out.len());
                        out.push(weh);
                    }
                }
            }
        }
        self.word_ends = out;
    }

    /// Drop silence alternatives from the sibling chains; they carry no
    /// information in a word lattice.
    pub fn optimize_silence_in_word_lattice(&mut self, silence: Token) {
        for weh in &self.word_ends {
            let mut previous = weh.trace.clone();
            loop {
                let next = previous.borrow().sibling.clone();
                match next {
                    Some(sibling) => {
                        let is_silence = sibling
                            .borrow()
                            .pronunciation
                            .map(|p| self.lexicon.pronunciation(p).lemma)
                            == Some(silence);
                        if is_silence {
                            let skip = sibling.borrow().sibling.clone();
                            previous.borrow_mut().sibling = skip;
                        } else {
                            previous = sibling;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    /// Enter every word end into the tree instance of its extended context,
    /// creating instances as needed.
    pub fn start_new_trees(&mut self) {
        let condition = self.options.condition_on_predecessor_word;
        let order = self.options.lookahead_order;
        let word_ends = std::mem::take(&mut self.word_ends);
        for weh in word_ends {
            let predecessor = if condition {
                last_pronunciation(&weh.trace)
            } else {
                None
            };
            let key = InstanceKey {
                history: weh.history,
                predecessor,
            };
            let reduced = self.lm.reduced_history(weh.lookahead_history, order);
            let id = self.instance_for_key(key, reduced);
            let score = weh.score.total();
            let instance = match &mut self.slots[id.index()] {
                Some(instance) => instance,
                None => continue,
            };
            instance.lookahead_history = Some(reduced);
            instance.enter(&mut self.traces, weh.trace, weh.transit_state, score);
        }
    }

    // ----- segment boundaries ---------------------------------------------

    /// Seed the search with the segment-start word end: the root matching
    /// the initial coarticulation, under the prefix-extended LM history.
    pub fn add_startup_word_end_hypothesis(
        &mut self,
        time: TimeframeIndex,
    ) -> Result<(), SearchError> {
        let mut history = self.lm.start_history();
        for &token in &self.context.prefix_words.clone() {
            history = self.lm.extended_history(history, token);
        }
        let transit = self.context.initial_transit;
        let root = self
            .network
            .root_for_coarticulation(transit)
            .ok_or(SearchError::NoRootForCoarticulation(transit.0, transit.1))?;
        let trace = Trace::root(time, ScoreVector::default());
        {
            let mut t = trace.borrow_mut();
            t.score.acoustic += self.global_score_offset;
            t.transit = self.network.transit_description(root);
        }
        self.word_ends.push(WordEndHypothesis {
            history,
            lookahead_history: history,
            transit_state: root,
            pronunciation: None,
            score: ScoreVector::default(),
            trace,
        });
        Ok(())
    }

    /// Close the segment: pick the best admissible word end, append suffix
    /// words and the sentence-end score, and return the final trace. In
    /// lattice modes the alternatives are threaded as siblings.
    pub fn get_sentence_end(
        &mut self,
        time: TimeframeIndex,
    ) -> Result<Option<TraceRef>, SearchError> {
        let lattice = self.options.lattice_mode != LatticeMode::SingleBest;
        let final_transit = self.context.final_transit;
        let force_root = if final_transit != NO_TRANSIT {
            Some(
                self.network
                    .root_for_coarticulation(final_transit)
                    .ok_or(SearchError::NoRootForCoarticulation(
                        final_transit.0,
                        final_transit.1,
                    ))?,
            )
        } else {
            None
        };

        let mut best: Option<TraceRef> = None;
        let mut best_score = INVALID_SCORE;
        let suffix = self.context.suffix_words.clone();

        for weh in &self.word_ends {
            let admissible = match force_root {
                Some(root) => weh.transit_state == root,
                None => {
                    weh.transit_state == self.network.root_state()
                        || weh.transit_state == self.network.ci_root_state()
                        || self
                            .network
                            .uncoarticulated_word_end_states()
                            .contains(&weh.transit_state)
                }
            };
            if !admissible {
                continue;
            }
            let trace = Trace::extend(
                weh.trace.clone(),
                None,
                time,
                weh.score,
                self.network.transit_description(weh.transit_state),
            );
            {
                let mut t = trace.borrow_mut();
                t.score.acoustic += self.global_score_offset;
                let mut h = weh.history;
                for &token in &suffix {
                    t.score.lm += self.lm.score(h, token);
                    h = self.lm.extended_history(h, token);
                }
                t.score.lm += self.lm.sentence_end_score(h);
            }
            let total = trace.borrow().score.total();
            select_best(&mut best, &mut best_score, trace, total, lattice);
        }

        // Words allowed to end without crossing an exit into a root: their
        // hypotheses still sit on the final state.
        if !self.network.uncoarticulated_word_end_states().is_empty() {
            let order = self.active.clone();
            for id in order {
                let (begin, end, back_off_offset) = {
                    let instance = self.inst(id);
                    (
                        instance.states_begin,
                        instance.states_end,
                        instance.total_back_off_offset,
                    )
                };
                for i in begin..end {
                    let hyp = self.arena.current[i as usize];
                    let admissible = match force_root {
                        Some(root) => hyp.state == root,
                        None => self
                            .network
                            .uncoarticulated_word_end_states()
                            .contains(&hyp.state),
                    };
                    if !admissible {
                        continue;
                    }
                    let (history, base) = {
                        let item = self.traces.trace_item(hyp.trace);
                        (item.history, item.trace.clone())
                    };
                    let absolute = hyp.score + self.global_score_offset;
                    let mut scores = base.borrow().score;
                    scores.acoustic = absolute - scores.lm - back_off_offset;
                    let boundary = Trace::extend(
                        base,
                        None,
                        time.saturating_sub(1),
                        scores,
                        self.network.transit_description(hyp.state),
                    );
                    let trace = Trace::extend(
                        boundary,
                        None,
                        time,
                        scores,
                        self.network.transit_description(self.network.root_state()),
                    );
                    {
                        let mut t = trace.borrow_mut();
                        let mut h = history;
                        for &token in &suffix {
                            t.score.lm += self.lm.score(h, token);
                            h = self.lm.extended_history(h, token);
                        }
                        t.score.lm += self.lm.sentence_end_score(h);
                    }
                    let total = trace.borrow().score.total();
                    select_best(&mut best, &mut best_score, trace, total, lattice);
                }
            }
        }

        self.had_word_end = best.is_some();
        Ok(best)
    }

    /// No admissible word end reached the segment end: back-trace from the
    /// best state hypothesis instead.
    pub fn get_sentence_end_fall_back(&mut self, time: TimeframeIndex) -> Option<TraceRef> {
        let hyp = *self
            .arena
            .current
            .iter()
            .min_by_key(|sh| OrderedFloat(sh.score))?;
        log::warn!("no matching word end at the segment end, using the best state hypothesis");
        let (history, predecessor) = {
            let item = self.traces.trace_item(hyp.trace);
            (item.history, item.trace.clone())
        };
        let predecessor_score = predecessor.borrow().score;
        let trace = Trace::extend(
            predecessor,
            None,
            time,
            predecessor_score,
            self.network.transit_description(self.network.root_state()),
        );
        {
            let mut t = trace.borrow_mut();
            t.score.acoustic = self.global_score_offset + hyp.score - predecessor_score.lm;
            let mut h = history;
            for &token in &self.context.suffix_words {
                t.score.lm += self.lm.score(h, token);
                h = self.lm.extended_history(h, token);
            }
            t.score.lm += self.lm.sentence_end_score(h);
        }
        Some(trace)
    }

    /// The deepest trace node every live hypothesis still shares. Everything
    /// up to and including it is decided; incremental consumers may flush it.
    pub fn common_prefix(&self) -> Option<TraceRef> {
        let mut anchors: Vec<TraceRef> = Vec::new();
        for sh in &self.arena.current {
            anchors.push(self.traces.trace_item(sh.trace).trace.clone());
        }
        for id in &self.active {
            if let Some(instance) = &self.slots[id.index()] {
                for sh in &instance.root_state_hypotheses {
                    anchors.push(self.traces.trace_item(sh.trace).trace.clone());
                }
            }
        }
        for weh in &self.word_ends {
            anchors.push(weh.trace.clone());
        }
        let first = anchors.first()?.clone();

        // Ancestor chain of the first anchor, sentence start first.
        let mut chain: Vec<TraceRef> = Vec::new();
        let mut current = Some(first);
        while let Some(t) = current {
            let predecessor = t.borrow().predecessor.clone();
            chain.push(t);
            current = predecessor;
        }
        chain.reverse();
        let index_of: FxHashMap<*const std::cell::RefCell<Trace>, usize> = chain
            .iter()
            .enumerate()
            .map(|(i, t)| (Rc::as_ptr(t), i))
            .collect();

        let mut deepest = chain.len() - 1;
        for anchor in &anchors[1..] {
            let mut current = Some(anchor.clone());
            while let Some(t) = current {
                if let Some(&i) = index_of.get(&Rc::as_ptr(&t)) {
                    deepest = deepest.min(i);
                    break;
                }
                current = t.borrow().predecessor.clone();
            }
        }
        Some(chain[deepest].clone())
    }

    // ----- housekeeping ---------------------------------------------------

    /// Compact the trace arena down to the items still referenced by live
    /// hypotheses and rewrite the ids, then drop unused lookahead tables.
    pub fn cleanup(&mut self) {
        let mut live: FxHashSet<TraceId> = FxHashSet::default();
        for sh in &self.arena.current {
            live.insert(sh.trace);
        }
        for id in &self.active {
            if let Some(instance) = &self.slots[id.index()] {
                for sh in &instance.root_state_hypotheses {
                    live.insert(sh.trace);
                }
            }
        }
        let map = self.traces.cleanup(&live);
        for sh in &mut self.arena.current {
            if let Some(&new) = map.get(&sh.trace) {
                sh.trace = new;
            }
        }
        for id in self.active.clone() {
            if let Some(instance) = self.slots[id.index()].as_mut() {
                for sh in &mut instance.root_state_hypotheses {
                    if let Some(&new) = map.get(&sh.trace) {
                        sh.trace = new;
                    }
                }
            }
        }
        if let Some(la) = &mut self.lookahead {
            la.free_unused_tables();
        }
    }

    /// Shift all relative scores down by `offset` and fold it into the
    /// global offset, keeping the scores numerically small. Word ends must
    /// have been consumed.
    pub fn rescale(&mut self, offset: Score) {
        debug_assert!(self.word_ends.is_empty() && self.early_word_ends.is_empty());
        debug_assert!(self.arena.next.is_empty());
        for sh in &mut self.arena.current {
            if sh.score != INVALID_SCORE {
                sh.score -= offset;
            }
            if sh.prospect != INVALID_SCORE {
                sh.prospect -= offset;
            }
        }
        for id in self.active.clone() {
            if let Some(instance) = self.slots[id.index()].as_mut() {
                for sh in &mut instance.root_state_hypotheses {
                    sh.score -= offset;
                    sh.prospect -= offset;
                }
            }
        }
        if self.min_word_end_score != INVALID_SCORE {
            self.min_word_end_score -= offset;
        }
        if self.best_prospect != INVALID_SCORE {
            self.best_prospect -= offset;
        }
        if self.best_score != INVALID_SCORE {
            self.best_score -= offset;
        }
        self.global_score_offset += offset;
    }

    /// Record the per-frame search space measurements.
    pub fn frame_statistics(&mut self) {
        let mut lemmas: FxHashSet<Token> = FxHashSet::default();
        for w in &self.word_ends {
            if let Some(pron) = w.pronunciation {
                lemmas.insert(self.lexicon.pronunciation(pron).lemma);
            }
        }
        let best = if self.best_prospect == INVALID_SCORE {
            INVALID_SCORE
        } else {
            self.best_prospect + self.global_score_offset
        };
        self.stats.frame(
            self.arena.current.len(),
            self.word_ends.len(),
            lemmas.len(),
            self.acoustic_saturated,
            best,
        );
    }

    pub fn log_statistics(&self) {
        self.stats.log_summary();
    }

    // ----- pruning control ------------------------------------------------

    /// Steer all thresholds from one master value. In histogram-master mode
    /// the value sets the state limit; otherwise it sets the acoustic beam
    /// and the dependent thresholds scale with it.
    pub fn set_master_beam(&mut self, value: Score) {
        if self.options.histogram_is_master {
            let scale = self.lm.scale();
            let new_limit = ((value / scale) as u32).max(1);
            let old_limit = self.pruning.acoustic_limit.max(1);
            if self.pruning.word_end_limit < self.pruning.acoustic_limit {
                self.pruning.word_end_limit = ((self.pruning.word_end_limit as u64
                    * new_limit as u64)
                    / old_limit as u64) as u32;
            }
            self.pruning.acoustic_limit = new_limit;
        } else {
            let ratio = value / self.pruning.acoustic;
            self.pruning.acoustic = value;
            if self.pruning.word_end != INVALID_SCORE {
                self.pruning.word_end *= ratio;
            }
            if self.pruning.lm_state != INVALID_SCORE {
                self.pruning.lm_state *= ratio;
            }
            if self.pruning.word_end_phoneme != INVALID_SCORE {
                self.pruning.word_end_phoneme *= ratio;
            }
        }
    }

    /// Widen the pruning by `beam * factor + offset`, bounded by the
    /// configured maxima and refused once the search space is already past
    /// its size maxima. Returns whether anything changed.
    pub fn relax_pruning(&mut self, factor: Score, offset: Score) -> bool {
        let scale = self.lm.scale();
        if self.options.histogram_is_master {
            let limit = self.pruning.acoustic_limit;
            if limit >= self.options.maximum_beam_limit {
                return false;
            }
            let new = ((limit as Score * factor + offset) as u32)
                .clamp(self.options.minimum_beam_limit, self.options.maximum_beam_limit);
            if new <= limit {
                return false;
            }
            self.set_master_beam(new as Score * scale);
            true
        } else {
            let beam = self.pruning.acoustic / scale;
            if beam >= self.options.maximum_beam {
                return false;
            }
            let frames = self.stats.frames.max(1) as f64;
            let saturation = self.stats.acoustic_pruning_saturated_frames as f64 / frames;
            if self.stats.states_after_pruning.average() > self.options.maximum_states_after_pruning
                || self.stats.word_ends_after_pruning.average()
                    > self.options.maximum_word_ends_after_pruning
                || saturation > self.options.maximum_acoustic_pruning_saturation
            {
                return false;
            }
            let new = (beam * factor + offset).clamp(self.options.minimum_beam, self.options.maximum_beam);
            if new <= beam {
                return false;
            }
            self.set_master_beam(new * scale);
            true
        }
    }

    pub fn describe_pruning(&self) -> PruningDesc {
        let beam = if self.options.histogram_is_master {
            self.pruning.acoustic_limit as Score
        } else {
            self.pruning.acoustic / self.lm.scale()
        };
        let frames = self.stats.frames.max(1) as f64;
        let saturation = self.stats.acoustic_pruning_saturated_frames as f64 / frames;
        let search_space_ok = self.had_word_end
            && self.stats.states_after_pruning.average() >= self.options.minimum_states_after_pruning
            && self.stats.word_ends_after_pruning.average()
                >= self.options.minimum_word_ends_after_pruning
            && self.stats.lemmas_after_recombination.average()
                >= self.options.minimum_word_lemmas_after_recombination
            && saturation <= self.options.maximum_acoustic_pruning_saturation;
        PruningDesc {
            beam,
            search_space_ok,
        }
    }

    pub fn reset_pruning(&mut self, desc: PruningDesc) {
        self.set_master_beam(desc.beam * self.lm.scale());
    }
}

/// Better score wins; on ties the smaller pronunciation id, and failing
/// that the already stored hypothesis.
fn recombine_two(incoming: WordEndHypothesis, stored: &mut WordEndHypothesis, lattice: bool) {
    let pron_key = |w: &WordEndHypothesis| w.pronunciation.unwrap_or(PronId::MAX);
    let incoming_total = incoming.score.total();
    let stored_total = stored.score.total();
    if stored_total > incoming_total
        || (stored_total == incoming_total && pron_key(stored) > pron_key(&incoming))
    {
        if lattice {
            debug_assert!(incoming.trace.borrow().sibling.is_none());
            incoming.trace.borrow_mut().sibling = Some(stored.trace.clone());
        }
        *stored = incoming;
    } else if lattice {
        let sibling = stored.trace.borrow().sibling.clone();
        incoming.trace.borrow_mut().sibling = sibling;
        stored.trace.borrow_mut().sibling = Some(incoming.trace);
    }
}

/// First minimum wins; later equal scores stay alternatives.
fn select_best(
    best: &mut Option<TraceRef>,
    best_score: &mut Score,
    trace: TraceRef,
    total: Score,
    lattice: bool,
) {
    if best.is_none() || total < *best_score {
        if lattice {
            if let Some(old) = best.take() {
                trace.borrow_mut().sibling = Some(old);
            }
        }
        *best_score = total;
        *best = Some(trace);
    } else if lattice {
        if let Some(b) = best {
            let sibling = b.borrow().sibling.clone();
            trace.borrow_mut().sibling = sibling;
            b.borrow_mut().sibling = Some(trace);
        }
    }
}

fn last_pronunciation(trace: &TraceRef) -> Option<PronId> {
    let mut current = Some(trace.clone());
    while let Some(t) = current {
        let t = t.borrow();
        if t.pronunciation.is_some() {
            return t.pronunciation;
        }
        current = t.predecessor.clone();
    }
    None
}

/// The decoded segment: final trace, chronological traceback, and the word
/// sequence with its total score.
#[derive(Debug, Clone)]
pub struct RecognitionResult {
    pub trace: TraceRef,
    pub traceback: Vec<TracebackItem>,
    pub words: Vec<Token>,
    pub score: ScoreVector,
}

/// Frame-loop driver around a [`SearchSpace`].
pub struct Recognizer {
    search: SearchSpace,
}

impl Recognizer {
    pub fn new(
        network: Network,
        lexicon: Lexicon,
        lm: Rc<dyn LanguageModel>,
        options: SearchOptions,
    ) -> Self {
        Self {
            search: SearchSpace::new(Rc::new(network), Rc::new(lexicon), lm, options),
        }
    }

    pub fn search(&self) -> &SearchSpace {
        &self.search
    }

    pub fn search_mut(&mut self) -> &mut SearchSpace {
        &mut self.search
    }

    pub fn decode(&mut self, scorer: &FrameScorer) -> Result<RecognitionResult, SearchError> {
        self.decode_with_context(scorer, RecognitionContext::new())
    }

    pub fn decode_with_context(
        &mut self,
        scorer: &FrameScorer,
        context: RecognitionContext,
    ) -> Result<RecognitionResult, SearchError> {
        self.search.clear();
        self.search.set_context(context);
        self.search.add_startup_word_end_hypothesis(0)?;

        let n_frames = scorer.n_frames();
        for t in 0..n_frames {
            self.search.start_new_trees();
            let best = self.search.best_score();
            if best != INVALID_SCORE {
                self.search.rescale(best);
            }
            self.search.cleanup();

            let frame = scorer.at_frame(t);
            self.search.set_current_time_frame(t as TimeframeIndex);
            self.search.expand_hmm();
            self.search.prune_and_add_scores(&frame);
            self.search.find_word_ends();
            self.search.prune_early_word_ends();
            self.search.create_traces(t as TimeframeIndex + 1);
            self.search.hypothesize_epsilon_pronunciations();
            self.search.recombine_word_ends();
            if let Some(silence) = self.search.options.optimize_silence_lemma {
                if self.search.options.lattice_mode != LatticeMode::SingleBest {
                    self.search.optimize_silence_in_word_lattice(silence);
                }
            }
            self.search.frame_statistics();
        }

        let time = n_frames as TimeframeIndex;
        let end = match self.search.get_sentence_end(time)? {
            Some(trace) => Some(trace),
            None => self.search.get_sentence_end_fall_back(time),
        };
        let end = end.ok_or(SearchError::EmptySearchSpace)?;
        self.search.log_statistics();

        let items = traceback(&end);
        let words = items
            .iter()
            .filter_map(|item| item.pronunciation)
            .map(|pron| self.search.lexicon.pronunciation(pron).lemma)
            .collect();
        let score = end.borrow().score;
        Ok(RecognitionResult {
            trace: end,
            traceback: items,
            words,
            score,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lm::{BackOffLM, ZeroLM};
    use crate::network::{NetworkBuilder, TransitionModel};

    fn trace_with_total(time: TimeframeIndex, total: Score) -> TraceRef {
        Trace::root(time, ScoreVector::new(total, 0.0))
    }

    #[test]
    fn sentence_end_selection_keeps_the_first_minimum() {
        let mut best: Option<TraceRef> = None;
        let mut best_score = INVALID_SCORE;
        let a = trace_with_total(1, 5.0);
        let b = trace_with_total(2, 3.0);
        let c = trace_with_total(3, 3.0);
        select_best(&mut best, &mut best_score, a, 5.0, true);
        select_best(&mut best, &mut best_score, b, 3.0, true);
        select_best(&mut best, &mut best_score, c, 3.0, true);

        let winner = best.unwrap();
        assert_eq!(best_score, 3.0);
        assert_eq!(winner.borrow().time, 2);
        // Alternatives are threaded behind the winner: c, then a.
        let first = winner.borrow().sibling.clone().unwrap();
        assert_eq!(first.borrow().time, 3);
        let second = first.borrow().sibling.clone().unwrap();
        assert_eq!(second.borrow().time, 1);
        assert!(second.borrow().sibling.is_none());
    }

    fn tiny_search(options: SearchOptions) -> SearchSpace {
        let mut lexicon = Lexicon::new(2);
        let word = lexicon.add_lemma("w").unwrap();
        let pron = lexicon.add_pronunciation(word, vec![0], 0.0).unwrap();

        let mut b = NetworkBuilder::new();
        let tm = b.add_transition_model(TransitionModel {
            loop_: 0.0,
            forward: 0.0,
            skip: 0.0,
            exit: 0.0,
        });
        let root = b.add_state(0, tm);
        let end = b.add_state(1, tm);
        b.set_root(root).unwrap();
        b.add_transition(root, end).unwrap();
        b.add_exit(end, Some(pron), root).unwrap();
        let network = b.build().unwrap();

        SearchSpace::new(
            Rc::new(network),
            Rc::new(lexicon),
            Rc::new(ZeroLM::new()),
            options,
        )
    }

    #[test]
    fn master_beam_rescales_relative_thresholds() {
        let options = SearchOptions {
            word_end_pruning: 0.5,
            lm_state_pruning: Some(0.5),
            ..SearchOptions::default()
        };
        let mut search = tiny_search(options);
        assert_eq!(search.pruning.acoustic, 12.0);
        assert_eq!(search.pruning.word_end, 6.0);
        assert_eq!(search.pruning.lm_state, 3.0);

        search.set_master_beam(24.0);
        assert_eq!(search.pruning.acoustic, 24.0);
        assert_eq!(search.pruning.word_end, 12.0);
        assert_eq!(search.pruning.lm_state, 6.0);
        assert_eq!(search.describe_pruning().beam, 24.0);

        // Relaxation clamps at the configured maximum beam.
        assert!(search.relax_pruning(2.0, 0.0));
        assert_eq!(search.describe_pruning().beam, 40.0);
        assert!(!search.relax_pruning(2.0, 0.0));
    }

    #[test]
    fn startup_word_end_survives_to_an_empty_segment_end() {
        let mut search = tiny_search(SearchOptions::default());
        search.add_startup_word_end_hypothesis(0).unwrap();
        let end = search.get_sentence_end(0).unwrap().unwrap();
        assert_eq!(end.borrow().score.total(), 0.0);
        assert!(traceback(&end).iter().all(|i| i.pronunciation.is_none()));
    }

    #[test]
    fn startup_trees_are_keyed_by_the_start_context() {
        let mut search = tiny_search(SearchOptions::default());
        search.add_startup_word_end_hypothesis(0).unwrap();
        search.start_new_trees();
        assert_eq!(search.n_active_instances(), 1);
        let key = InstanceKey {
            history: search.lm.start_history(),
            predecessor: None,
        };
        assert!(search.instance_map.contains_key(&key));
    }

    #[test]
    fn recombining_word_ends_twice_is_a_no_op() {
        let mut search = tiny_search(SearchOptions::default());
        let h = search.lm.start_history();
        let root = search.network.root_state();
        let entry = |acoustic: Score| WordEndHypothesis {
            history: h,
            lookahead_history: h,
            transit_state: root,
            pronunciation: Some(0),
            score: ScoreVector::new(acoustic, 0.0),
            trace: Trace::root(1, ScoreVector::new(acoustic, 0.0)),
        };
        search.word_ends.push(entry(1.0));
        search.word_ends.push(entry(0.5));
        search.word_ends.push(entry(2.0));

        let chain_totals = |weh: &WordEndHypothesis| {
            let mut totals = Vec::new();
            let mut current = Some(weh.trace.clone());
            while let Some(t) = current {
                totals.push(t.borrow().score.total());
                current = t.borrow().sibling.clone();
            }
            totals
        };

        search.recombine_word_ends();
        assert_eq!(search.word_ends.len(), 1);
        assert_eq!(search.word_ends[0].score.total(), 0.5);
        assert_eq!(chain_totals(&search.word_ends[0]), vec![0.5, 2.0, 1.0]);

        // A second pass finds one entry per key and must change nothing.
        search.recombine_word_ends();
        assert_eq!(search.word_ends.len(), 1);
        assert_eq!(search.word_ends[0].score.total(), 0.5);
        assert_eq!(chain_totals(&search.word_ends[0]), vec![0.5, 2.0, 1.0]);
    }

    #[test]
    fn instance_ranges_cover_the_arena_after_pruning() {
        let mut lexicon = Lexicon::new(2);
        let a = lexicon.add_lemma("a").unwrap();
        let b = lexicon.add_lemma("b").unwrap();
        let pron_a = lexicon.add_pronunciation(a, vec![0], 0.0).unwrap();
        let pron_b = lexicon.add_pronunciation(b, vec![1], 0.0).unwrap();

        let mut builder = NetworkBuilder::new();
        let tm = builder.add_transition_model(TransitionModel {
            loop_: 0.5,
            forward: 0.0,
            skip: 0.0,
            exit: 0.0,
        });
        let root = builder.add_state(0, tm);
        let sa = builder.add_state(1, tm);
        let sb = builder.add_state(2, tm);
        builder.set_root(root).unwrap();
        builder.add_transition(root, sa).unwrap();
        builder.add_transition(root, sb).unwrap();
        builder.add_exit(sa, Some(pron_a), root).unwrap();
        builder.add_exit(sb, Some(pron_b), root).unwrap();
        let network = builder.build().unwrap();

        let mut lm = BackOffLM::new(2);
        lm.set_word_score(&[], a, 0.2);
        lm.set_word_score(&[], b, 0.4);

        let mut search = SearchSpace::new(
            Rc::new(network),
            Rc::new(lexicon),
            Rc::new(lm),
            SearchOptions::default(),
        );
        search.add_startup_word_end_hypothesis(0).unwrap();
        let scorer = FrameScorer::new(
            vec![
                9.0, 0.0, 1.0, //
                9.0, 1.0, 0.0, //
                9.0, 0.5, 0.5, //
            ],
            3,
        );
        for t in 0..3u32 {
            search.start_new_trees();
            let best = search.best_score();
            if best != INVALID_SCORE {
                search.rescale(best);
            }
            search.cleanup();
            search.set_current_time_frame(t);
            search.expand_hmm();
            search.prune_and_add_scores(&scorer.at_frame(t as usize));

            // Every surviving hypothesis belongs to exactly one instance
            // range, and the ranges tile the compacted buffer.
            let covered: u32 = search
                .active
                .iter()
                .map(|&id| search.inst(id).n_states())
                .sum();
            assert_eq!(search.arena.current.len() as u32, covered);

            search.find_word_ends();
            search.prune_early_word_ends();
            search.create_traces(t + 1);
            search.hypothesize_epsilon_pronunciations();
            search.recombine_word_ends();
        }
        // Distinct bigram contexts got their own tree instances.
        assert!(search.n_active_instances() > 1);
    }
}
