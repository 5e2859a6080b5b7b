use rustc_hash::FxHashMap;

use crate::lexicon::Lexicon;
use crate::search::arena::StateHypothesis;
use crate::trace::{TraceId, TraceManager, TraceRef};
use crate::{Score, Token, INVALID_SCORE};

pub struct PruneContext<'a> {
    pub traces: &'a TraceManager,
    pub lexicon: &'a Lexicon,
}

/// Per-hypothesis policy applied while lookahead scores are attached.
/// `prepare` may observe/adjust the hypothesis, `prune` decides removal.
pub trait Pruning {
    fn prepare(&mut self, hyp: &mut StateHypothesis) {
        let _ = hyp;
    }

    fn prune(&mut self, ctx: &PruneContext<'_>, hyp: &StateHypothesis) -> bool;
}

/// Tracks the frame minimum without pruning anything.
#[derive(Debug)]
pub struct RecordMinimum {
    pub best_prospect: Score,
    pub best_score: Score,
}

impl Default for RecordMinimum {
    fn default() -> Self {
        Self {
            best_prospect: INVALID_SCORE,
            best_score: INVALID_SCORE,
        }
    }
}

impl Pruning for RecordMinimum {
    fn prepare(&mut self, hyp: &mut StateHypothesis) {
        if hyp.prospect < self.best_prospect {
            self.best_prospect = hyp.prospect;
            self.best_score = hyp.score;
        }
    }

    fn prune(&mut self, _ctx: &PruneContext<'_>, _hyp: &StateHypothesis) -> bool {
        false
    }
}

/// Beam pruning against the running best prospect. Processing order only
/// affects which hypotheses are dropped early; the final threshold is the
/// same as with a separate minimum pass.
#[derive(Debug)]
pub struct BeamPruning {
    pub threshold: Score,
    pub minimum: RecordMinimum,
}

impl BeamPruning {
    pub fn new(threshold: Score) -> Self {
        Self {
            threshold,
            minimum: RecordMinimum::default(),
        }
    }
}

impl Pruning for BeamPruning {
    fn prepare(&mut self, hyp: &mut StateHypothesis) {
        self.minimum.prepare(hyp);
    }

    fn prune(&mut self, _ctx: &PruneContext<'_>, hyp: &StateHypothesis) -> bool {
        hyp.prospect > self.minimum.best_prospect + self.threshold
    }
}

/// Restricts the search to hypotheses whose word sequence is compatible
/// with a prescribed prefix. Decisions are cached per trace id.
#[derive(Debug)]
pub struct PrefixFilter {
    words: Vec<Token>,
    cache: FxHashMap<TraceId, bool>,
}

impl PrefixFilter {
    pub fn new(words: Vec<Token>) -> Self {
        Self {
            words,
            cache: FxHashMap::default(),
        }
    }

    fn word_chain(ctx: &PruneContext<'_>, trace: &TraceRef) -> Vec<Token> {
        let mut chain = Vec::new();
        let mut current = Some(trace.clone());
        while let Some(t) = current {
            let t = t.borrow();
            if let Some(pron) = t.pronunciation {
                chain.push(ctx.lexicon.pronunciation(pron).lemma);
            }
            current = t.predecessor.clone();
        }
        chain.reverse();
        chain
    }

    fn allowed(&self, ctx: &PruneContext<'_>, id: TraceId) -> bool {
        let chain = Self::word_chain(ctx, &ctx.traces.trace_item(id).trace);
        let n = chain.len().min(self.words.len());
        chain[..n] == self.words[..n]
    }
}

impl Pruning for PrefixFilter {
    fn prune(&mut self, ctx: &PruneContext<'_>, hyp: &StateHypothesis) -> bool {
        let id = ctx.traces.unmodified(hyp.trace);
        if let Some(&allowed) = self.cache.get(&id) {
            return !allowed;
        }
        let allowed = self.allowed(ctx, id);
        self.cache.insert(id, allowed);
        !allowed
    }
}
