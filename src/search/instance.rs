use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::lexicon::Lexicon;
use crate::lm::{History, LanguageModel};
use crate::search::arena::{StateHypothesis, StateHypothesisIndex};
use crate::search::lookahead::ContextLookahead;
use crate::trace::{TraceManager, TraceRef};
use crate::{PronId, Score, StateId};

/// Stable handle of an [`Instance`]. Links between instances are held as
/// ids and severed explicitly on deactivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(pub(crate) u32);

impl InstanceId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Identity of a tree instance: the LM context it expands under. Back-off
/// children share their parent's key but are never registered in the key
/// map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub history: History,
    pub predecessor: Option<PronId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceVariant {
    Root,
    BackOff { parent: InstanceId },
}

/// One copy of the prefix tree, active for a particular LM context.
#[derive(Debug)]
pub struct Instance {
    pub id: InstanceId,
    pub key: InstanceKey,
    pub variant: InstanceVariant,
    /// Full LM history used for word scoring.
    pub history: History,
    /// Possibly reduced history the lookahead tables are keyed by.
    pub lookahead_history: Option<History>,
    pub lookahead: Option<Rc<ContextLookahead>>,

    /// Word ends entering this tree, expanded at the next frame.
    pub root_state_hypotheses: Vec<StateHypothesis>,
    /// Hypotheses handed down from the parent after a sparse lookahead miss.
    pub transfer: Vec<StateHypothesisIndex>,
    /// Range of this instance's hypotheses in the current arena buffer.
    pub states_begin: u32,
    pub states_end: u32,

    pub back_off_child: Option<InstanceId>,
    /// Penalty for dropping from the parent's context to this one.
    pub back_off_score: Score,
    /// Sum of back-off penalties accumulated along the chain from the root
    /// instance; subtracted again when word scores are finalized.
    pub total_back_off_offset: Score,

    /// Consecutive frames without any active state.
    pub inactive: u32,

    cached_lm_scores: FxHashMap<PronId, Score>,
}

impl Instance {
    pub fn new(id: InstanceId, key: InstanceKey, variant: InstanceVariant, history: History) -> Self {
        Self {
            id,
            key,
            variant,
            history,
            lookahead_history: None,
            lookahead: None,
            root_state_hypotheses: Vec::new(),
            transfer: Vec::new(),
            states_begin: 0,
            states_end: 0,
            back_off_child: None,
            back_off_score: 0.0,
            total_back_off_offset: 0.0,
            inactive: 0,
            cached_lm_scores: FxHashMap::default(),
        }
    }

    pub fn n_states(&self) -> u32 {
        self.states_end - self.states_begin
    }

    /// Register a word end entering this tree at `root`. Allocates the
    /// trace item binding the trace to this instance's LM context.
    pub fn enter(
        &mut self,
        traces: &mut TraceManager,
        trace: TraceRef,
        root: StateId,
        score: Score,
    ) {
        for existing in &mut self.root_state_hypotheses {
            if existing.state == root {
                if score < existing.score {
                    existing.score = score;
                    existing.prospect = score;
                    existing.trace = traces.add(
                        trace,
                        self.history,
                        self.lookahead_history.unwrap_or(self.history),
                    );
                }
                return;
            }
        }
        let item = traces.add(
            trace,
            self.history,
            self.lookahead_history.unwrap_or(self.history),
        );
        self.root_state_hypotheses.push(StateHypothesis {
            state: root,
            trace: item,
            score,
            prospect: score,
        });
    }

    /// Cached scaled LM score of a pronunciation in this context.
    pub fn add_lm_score(
        &mut self,
        lm: &dyn LanguageModel,
        lexicon: &Lexicon,
        pron: PronId,
        pron_scale: Score,
    ) -> Score {
        if let Some(&score) = self.cached_lm_scores.get(&pron) {
            return score;
        }
        let score = lm.pronunciation_score(self.history, lexicon.pronunciation(pron), pron_scale);
        self.cached_lm_scores.insert(pron, score);
        score
    }

    /// True when nothing keeps the instance alive this frame.
    pub fn may_deactivate(&self) -> bool {
        self.n_states() == 0 && self.root_state_hypotheses.is_empty() && self.transfer.is_empty()
    }
}
