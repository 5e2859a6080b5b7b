use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::lexicon::Lexicon;
use crate::lm::{History, LanguageModel};
use crate::network::Network;
use crate::{Score, StateId, Token, INVALID_SCORE};

/// One lookahead node: an equivalence class of network states sharing the
/// same set of reachable word exits. The table value of a node is the
/// minimum LM score over that set, computed by propagation from the deeper
/// nodes.
#[derive(Debug)]
pub struct LookaheadNode {
    pub depth: u32,
    exit_tokens: Vec<Token>,
    successors: Vec<u32>,
}

/// LM lookahead structure over the compiled network plus the per-history
/// table cache. Tables are shared with the instances through `Rc`; unused
/// tables are dropped once nothing references them.
#[derive(Debug)]
pub struct LmLookahead {
    nodes: Vec<LookaheadNode>,
    state_to_node: Vec<u32>,
    fill_order: Vec<u32>,
    tables: FxHashMap<History, Rc<ContextLookahead>>,
}

impl LmLookahead {
    pub fn new(network: &Network, lexicon: &Lexicon) -> Self {
        let n = network.n_states();

        // Reachable exit-token set per state, deepest states first.
        let mut order: Vec<StateId> = (1..n as StateId).collect();
        order.sort_unstable_by_key(|&s| std::cmp::Reverse(network.depth(s)));

        let mut reach: Vec<Rc<Vec<Token>>> = vec![Rc::new(Vec::new()); n];
        let mut class_of_set: FxHashMap<Vec<Token>, u32> = FxHashMap::default();
        let mut state_to_node = vec![u32::MAX; n];
        let mut members: Vec<Vec<StateId>> = Vec::new();

        for &s in &order {
            let mut set: Vec<Token> = Vec::new();
            for exit in network.exits_of(s) {
                if let Some(pron) = network.exit(exit).pronunciation {
                    set.push(lexicon.pronunciation(pron).lemma);
                }
            }
            for &succ in network.successors(s) {
                set.extend(reach[succ as usize].iter().copied());
            }
            set.sort_unstable();
            set.dedup();

            let node = *class_of_set.entry(set.clone()).or_insert_with(|| {
                members.push(Vec::new());
                members.len() as u32 - 1
            });
            members[node as usize].push(s);
            state_to_node[s as usize] = node;
            reach[s as usize] = Rc::new(set);
        }

        let mut nodes: Vec<LookaheadNode> = Vec::with_capacity(members.len());
        for states in &members {
            let mut depth = u32::MAX;
            let mut exit_tokens = Vec::new();
            let mut successors = Vec::new();
            let own = state_to_node[states[0] as usize];
            for &s in states {
                depth = depth.min(network.depth(s));
                for exit in network.exits_of(s) {
                    if let Some(pron) = network.exit(exit).pronunciation {
                        exit_tokens.push(lexicon.pronunciation(pron).lemma);
                    }
                }
                for &succ in network.successors(s) {
                    let node = state_to_node[succ as usize];
                    if node != own {
                        successors.push(node);
                    }
                }
            }
            exit_tokens.sort_unstable();
            exit_tokens.dedup();
            successors.sort_unstable();
            successors.dedup();
            nodes.push(LookaheadNode {
                depth,
                exit_tokens,
                successors,
            });
        }

        let fill_order = topological_fill_order(&nodes);

        Self {
            nodes,
            state_to_node,
            fill_order,
            tables: FxHashMap::default(),
        }
    }

    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_of(&self, state: StateId) -> u32 {
        self.state_to_node[state as usize]
    }

    /// The highest node id that still lies at `depth` or deeper. Deeper
    /// nodes get smaller ids, so `node <= last_node_on_depth(d)` approximates
    /// a depth cutoff without touching the depth array per hypothesis.
    pub fn last_node_on_depth(&self, depth: u32) -> Option<u32> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.depth >= depth)
            .map(|(id, _)| id as u32)
            .last()
    }

    /// Cached lookup of the table for `history`, filling it on a miss.
    pub fn get_lookahead(
        &mut self,
        lm: &dyn LanguageModel,
        history: History,
        sparse: bool,
    ) -> Rc<ContextLookahead> {
        if let Some(table) = self.tables.get(&history) {
            return table.clone();
        }
        let table = Rc::new(self.fill(lm, history, sparse));
        self.tables.insert(history, table.clone());
        table
    }

    pub fn try_get_lookahead(&self, history: History) -> Option<Rc<ContextLookahead>> {
        self.tables.get(&history).cloned()
    }

    /// Drop tables no instance holds anymore.
    pub fn free_unused_tables(&mut self) {
        self.tables.retain(|_, table| Rc::strong_count(table) > 1);
    }

    /// Drop the whole cache, shared or not. Used between segments.
    pub fn clear_tables(&mut self) {
        self.tables.clear();
    }

    fn fill(&self, lm: &dyn LanguageModel, history: History, sparse: bool) -> ContextLookahead {
        if sparse {
            if let Some(words) = lm.words_with_scores(history) {
                return self.fill_sparse(history, &words);
            }
        }
        self.fill_dense(lm, history)
    }

    fn fill_dense(&self, lm: &dyn LanguageModel, history: History) -> ContextLookahead {
        let mut scores = vec![INVALID_SCORE; self.nodes.len()];
        for &id in &self.fill_order {
            let node = &self.nodes[id as usize];
            let mut best = INVALID_SCORE;
            for &token in &node.exit_tokens {
                let s = lm.score(history, token);
                if s < best {
                    best = s;
                }
            }
            for &succ in &node.successors {
                if scores[succ as usize] < best {
                    best = scores[succ as usize];
                }
            }
            scores[id as usize] = best;
        }
        ContextLookahead {
            history,
            scores,
            sparse: None,
        }
    }

    /// Sparse table: only nodes from which an explicitly scored word is
    /// reachable get an entry; everything else is a miss handled through
    /// the back-off chain.
    fn fill_sparse(&self, history: History, words: &[(Token, Score)]) -> ContextLookahead {
        let word_scores: FxHashMap<Token, Score> = words.iter().copied().collect();
        let mut map: FxHashMap<u32, Score> = FxHashMap::default();
        for &id in &self.fill_order {
            let node = &self.nodes[id as usize];
            let mut best = INVALID_SCORE;
            for &token in &node.exit_tokens {
                if let Some(&s) = word_scores.get(&token) {
                    if s < best {
                        best = s;
                    }
                }
            }
            for &succ in &node.successors {
                if let Some(&s) = map.get(&succ) {
                    if s < best {
                        best = s;
                    }
                }
            }
            if best != INVALID_SCORE {
                map.insert(id, best);
            }
        }
        ContextLookahead {
            history,
            scores: Vec::new(),
            sparse: Some(map),
        }
    }

}

// Nodes ordered so that every successor comes first. The successor relation
// follows strict reachable-set inclusion, so it is acyclic.
fn topological_fill_order(nodes: &[LookaheadNode]) -> Vec<u32> {
    let n = nodes.len();
    let mut in_degree = vec![0u32; n];
    let mut dependents: Vec<Vec<u32>> = vec![Vec::new(); n];
    for (id, node) in nodes.iter().enumerate() {
        for &succ in &node.successors {
            dependents[succ as usize].push(id as u32);
            in_degree[id] += 1;
        }
    }
    let mut order: Vec<u32> = (0..n as u32).filter(|&id| in_degree[id as usize] == 0).collect();
    let mut head = 0;
    while head < order.len() {
        let id = order[head];
        head += 1;
        for &dep in &dependents[id as usize] {
            in_degree[dep as usize] -= 1;
            if in_degree[dep as usize] == 0 {
                order.push(dep);
            }
        }
    }
    debug_assert_eq!(order.len(), n);
    order
}

/// Lookahead score table for one LM context.
#[derive(Debug)]
pub struct ContextLookahead {
    pub history: History,
    scores: Vec<Score>,
    sparse: Option<FxHashMap<u32, Score>>,
}

impl ContextLookahead {
    pub fn is_sparse(&self) -> bool {
        self.sparse.is_some()
    }

    /// `None` on a sparse miss.
    pub fn score(&self, node: u32) -> Option<Score> {
        match &self.sparse {
            Some(map) => map.get(&node).copied(),
            None => {
                let s = self.scores[node as usize];
                if s == INVALID_SCORE {
                    None
                } else {
                    Some(s)
                }
            }
        }
    }

    pub fn n_entries(&self) -> usize {
        match &self.sparse {
            Some(map) => map.len(),
            None => self.scores.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lm::BackOffLM;
    use crate::network::{NetworkBuilder, TransitionModel};

    // Two words "ab" and "ac" sharing the first arc.
    fn shared_prefix() -> (Network, Lexicon, Token, Token) {
        let mut lexicon = Lexicon::new(3);
        let ab = lexicon.add_lemma("ab").unwrap();
        let ac = lexicon.add_lemma("ac").unwrap();
        let pron_ab = lexicon.add_pronunciation(ab, vec![0, 1], 0.0).unwrap();
        let pron_ac = lexicon.add_pronunciation(ac, vec![0, 2], 0.0).unwrap();

        let mut b = NetworkBuilder::new();
        let tm = b.add_transition_model(TransitionModel {
            loop_: 0.0,
            forward: 0.0,
            skip: 0.0,
            exit: 0.0,
        });
        let root = b.add_state(0, tm);
        let a = b.add_state(1, tm);
        let end_b = b.add_state(2, tm);
        let end_c = b.add_state(3, tm);
        b.set_root(root).unwrap();
        b.add_transition(root, a).unwrap();
        b.add_transition(a, end_b).unwrap();
        b.add_transition(a, end_c).unwrap();
        b.add_exit(end_b, Some(pron_ab), root).unwrap();
        b.add_exit(end_c, Some(pron_ac), root).unwrap();
        let network = b.build().unwrap();
        (network, lexicon, ab, ac)
    }

    #[test]
    fn shared_prefix_states_share_a_node() {
        let (network, lexicon, _, _) = shared_prefix();
        let lookahead = LmLookahead::new(&network, &lexicon);
        // root and the shared arc state reach {ab, ac}; the two word-end
        // states reach distinct singleton sets.
        assert_eq!(lookahead.node_of(1), lookahead.node_of(2));
        assert_ne!(lookahead.node_of(3), lookahead.node_of(4));
        assert_eq!(lookahead.n_nodes(), 3);
    }

    #[test]
    fn dense_table_propagates_the_minimum() {
        let (network, lexicon, ab, ac) = shared_prefix();
        let mut lookahead = LmLookahead::new(&network, &lexicon);

        let mut lm = BackOffLM::new(1);
        lm.set_word_score(&[], ab, 3.0);
        lm.set_word_score(&[], ac, 1.0);
        let h = lm.start_history();

        let table = lookahead.get_lookahead(&lm, h, false);
        assert!(!table.is_sparse());
        assert_eq!(table.n_entries(), 3);
        assert_eq!(table.score(lookahead.node_of(1)), Some(1.0));
        assert_eq!(table.score(lookahead.node_of(3)), Some(3.0));
        assert_eq!(table.score(lookahead.node_of(4)), Some(1.0));
    }

    #[test]
    fn sparse_table_misses_unscored_branches() {
        let (network, lexicon, ab, _ac) = shared_prefix();
        let mut lookahead = LmLookahead::new(&network, &lexicon);

        let mut lm = BackOffLM::new(2);
        let h0 = lm.start_history();
        let h = lm.extended_history(h0, ab);
        lm.set_word_score(&[ab], ab, 2.0);

        let table = lookahead.get_lookahead(&lm, h, true);
        assert!(table.is_sparse());
        // Entries exist only where "ab" is reachable.
        assert_eq!(table.n_entries(), 2);
        // The branch towards "ac" has no explicit bigram, so it is a miss.
        assert_eq!(table.score(lookahead.node_of(4)), None);
        assert_eq!(table.score(lookahead.node_of(3)), Some(2.0));
        assert_eq!(table.score(lookahead.node_of(1)), Some(2.0));
    }

    #[test]
    fn unused_tables_are_freed() {
        let (network, lexicon, _, _) = shared_prefix();
        let mut lookahead = LmLookahead::new(&network, &lexicon);
        let lm = BackOffLM::new(1);
        let h = lm.start_history();
        {
            let _table = lookahead.get_lookahead(&lm, h, false);
            lookahead.free_unused_tables();
            assert!(lookahead.try_get_lookahead(h).is_some());
        }
        lookahead.free_unused_tables();
        assert!(lookahead.try_get_lookahead(h).is_none());
    }

    #[test]
    fn clearing_drops_even_shared_tables() {
        let (network, lexicon, _, _) = shared_prefix();
        let mut lookahead = LmLookahead::new(&network, &lexicon);
        let lm = BackOffLM::new(1);
        let h = lm.start_history();
        let _table = lookahead.get_lookahead(&lm, h, false);
        lookahead.clear_tables();
        assert!(lookahead.try_get_lookahead(h).is_none());
    }
}
