use crate::trace::TraceId;
use crate::{Score, StateId};

pub type StateHypothesisIndex = u32;

/// One live path ending in a network state. `prospect` is the pruning
/// score: path score plus lookahead estimates.
#[derive(Debug, Clone, Copy)]
pub struct StateHypothesis {
    pub state: StateId,
    pub trace: TraceId,
    pub score: Score,
    pub prospect: Score,
}

/// Double-buffered hypothesis storage with a per-network-state
/// recombination index. The recombination array is never cleared; an entry
/// is trusted only if it points into the window of the instance currently
/// being expanded and the hypothesis there is actually on the looked-up
/// state.
#[derive(Debug)]
pub struct HypothesisArena {
    pub current: Vec<StateHypothesis>,
    pub next: Vec<StateHypothesis>,
    recombination: Vec<StateHypothesisIndex>,
    current_tree_first: StateHypothesisIndex,
}

impl HypothesisArena {
    pub fn new(n_states: usize) -> Self {
        Self {
            current: Vec::new(),
            next: Vec::new(),
            recombination: vec![StateHypothesisIndex::MAX; n_states],
            current_tree_first: 0,
        }
    }

    /// Start a new instance window: recombination entries from earlier
    /// instances become invalid from here on.
    pub fn begin_instance(&mut self) {
        self.current_tree_first = self.next.len() as StateHypothesisIndex;
    }

    pub fn current_tree_first(&self) -> StateHypothesisIndex {
        self.current_tree_first
    }

    fn live_entry(&self, state: StateId) -> Option<usize> {
        let idx = self.recombination[state as usize];
        if idx >= self.current_tree_first
            && (idx as usize) < self.next.len()
            && self.next[idx as usize].state == state
        {
            Some(idx as usize)
        } else {
            None
        }
    }

    fn push(&mut self, hyp: StateHypothesis) {
        self.recombination[hyp.state as usize] = self.next.len() as StateHypothesisIndex;
        self.next.push(hyp);
    }

    fn activate_or_update(&mut self, state: StateId, trace: TraceId, score: Score) {
        match self.live_entry(state) {
            Some(idx) => {
                let sh = &mut self.next[idx];
                // Lower score wins; on a tie the first-stored path stays.
                if score < sh.score {
                    sh.score = score;
                    sh.trace = trace;
                }
            }
            None => self.push(StateHypothesis {
                state,
                trace,
                score,
                prospect: score,
            }),
        }
    }

    pub fn activate_or_update_loop(&mut self, hyp: &StateHypothesis, score: Score) {
        self.activate_or_update(hyp.state, hyp.trace, score);
    }

    pub fn activate_or_update_transition(
        &mut self,
        hyp: &StateHypothesis,
        score: Score,
        successor: StateId,
    ) {
        self.activate_or_update(successor, hyp.trace, score);
    }

    pub fn activate_or_update_direct(&mut self, hyp: &StateHypothesis) {
        self.activate_or_update(hyp.state, hyp.trace, hyp.score);
    }

    /// Make the freshly expanded hypotheses current. The old current buffer
    /// is reused as the next frame's target.
    pub fn swap(&mut self) {
        std::mem::swap(&mut self.current, &mut self.next);
        self.next.clear();
        self.current_tree_first = 0;
    }

    pub fn clear(&mut self) {
        self.current.clear();
        self.next.clear();
        self.recombination.fill(StateHypothesisIndex::MAX);
        self.current_tree_first = 0;
    }

    // The per-LM-state pruning pass reuses the recombination array with its
    // own index encoding over the current buffer.
    pub(crate) fn recombination_mut(&mut self) -> (&mut Vec<StateHypothesisIndex>, &mut Vec<StateHypothesis>) {
        (&mut self.recombination, &mut self.current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hyp(state: StateId, score: Score) -> StateHypothesis {
        StateHypothesis {
            state,
            trace: crate::trace::TraceId::placeholder(),
            score,
            prospect: score,
        }
    }

    #[test]
    fn recombines_within_the_instance_window() {
        let mut arena = HypothesisArena::new(10);
        arena.begin_instance();
        arena.activate_or_update_loop(&hyp(3, 5.0), 5.0);
        arena.activate_or_update_transition(&hyp(2, 9.0), 4.0, 3);
        assert_eq!(arena.next.len(), 1);
        assert_eq!(arena.next[0].score, 4.0);

        // Worse and equal scores leave the stored hypothesis alone.
        arena.activate_or_update_transition(&hyp(2, 9.0), 6.0, 3);
        arena.activate_or_update_transition(&hyp(2, 9.0), 4.0, 3);
        assert_eq!(arena.next.len(), 1);
        assert_eq!(arena.next[0].score, 4.0);
    }

    #[test]
    fn stale_entries_are_not_reused_across_instances() {
        let mut arena = HypothesisArena::new(10);
        arena.begin_instance();
        arena.activate_or_update_direct(&hyp(3, 5.0));
        assert_eq!(arena.next.len(), 1);

        // A second instance must not recombine into the first one's entry.
        arena.begin_instance();
        arena.activate_or_update_direct(&hyp(3, 7.0));
        assert_eq!(arena.next.len(), 2);
        assert_eq!(arena.next[1].score, 7.0);
    }

    #[test]
    fn swap_invalidates_the_window() {
        let mut arena = HypothesisArena::new(10);
        arena.begin_instance();
        arena.activate_or_update_direct(&hyp(3, 5.0));
        arena.swap();
        assert_eq!(arena.current.len(), 1);
        assert!(arena.next.is_empty());

        arena.begin_instance();
        arena.activate_or_update_direct(&hyp(3, 9.0));
        assert_eq!(arena.next.len(), 1);
        assert_eq!(arena.next[0].score, 9.0);
    }
}
