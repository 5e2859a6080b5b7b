use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::{MixtureId, PronId, Score, StateId, Transit, NO_TRANSIT};

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("state {0} is out of range")]
    InvalidState(StateId),
    #[error("no root state set")]
    MissingRoot,
    #[error("transition model {0} is undefined")]
    MissingTransitionModel(u32),
    #[error("network contains a transition cycle through state {0}")]
    Cycle(StateId),
    #[error("state {from} (depth {from_depth}) has successor {to} (depth {to_depth}); successors must be strictly deeper")]
    DepthConflict {
        from: StateId,
        from_depth: u32,
        to: StateId,
        to_depth: u32,
    },
}

/// Scores of the HMM transition types, indexed by the state's
/// transition-model id.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransitionModel {
    pub loop_: Score,
    pub forward: Score,
    pub skip: Score,
    pub exit: Score,
}

/// Per-state payload: emission mixture and transition-model id.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateDesc {
    pub mixture: MixtureId,
    pub transition_model: u32,
}

/// Precomputed successor enumeration hint. `Range` covers the common case of
/// one ascending contiguous id run; `Irregular` falls back to the CSR slice.
/// Both paths yield identical expansion results.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SuccessorBatch {
    Range(StateId, StateId),
    Irregular,
}

/// Like [`SuccessorBatch`] for second-order (skip) successors. `Forbidden`
/// marks boundary states where a skip would jump across the root level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SkipBatch {
    Range(StateId, StateId),
    Irregular,
    Forbidden,
}

/// Output label attached to a state: completing the word emits
/// `pronunciation` and re-enters the network at `transit_state`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Exit {
    pub pronunciation: Option<PronId>,
    pub transit_state: StateId,
}

/// Compiled prefix-tree HMM network. Read-only during search; state 0 is
/// reserved as invalid.
#[derive(Debug, Clone)]
pub struct Network {
    states: Vec<StateDesc>,
    transition_models: Vec<TransitionModel>,

    succ_offsets: Vec<u32>,
    succ: Vec<StateId>,
    batches: Vec<SuccessorBatch>,

    skip_offsets: Vec<u32>,
    skip: Vec<StateId>,
    skip_batches: Vec<SkipBatch>,

    exits: Vec<Exit>,
    // Per state: -1 none, >= 0 single exit id, -2 contiguous range in
    // quick_label_batches, <= -3 index into slow_label_batches.
    single_labels: Vec<i32>,
    quick_label_batches: Vec<u32>,
    slow_label_batches: Vec<i32>,

    depths: Vec<u32>,
    root_depth: u32,

    root_state: StateId,
    ci_root_state: StateId,
    coarticulated_roots: FxHashSet<StateId>,
    unpushed_coarticulated_roots: FxHashSet<StateId>,
    uncoarticulated_word_end_states: Vec<StateId>,
    root_transit_descriptions: FxHashMap<StateId, Transit>,
}

impl Network {
    pub fn n_states(&self) -> usize {
        self.states.len()
    }

    pub fn state(&self, s: StateId) -> StateDesc {
        self.states[s as usize]
    }

    pub fn transition_model(&self, s: StateId) -> &TransitionModel {
        &self.transition_models[self.states[s as usize].transition_model as usize]
    }

    pub fn successors(&self, s: StateId) -> &[StateId] {
        &self.succ[self.succ_offsets[s as usize] as usize..self.succ_offsets[s as usize + 1] as usize]
    }

    pub fn batch(&self, s: StateId) -> SuccessorBatch {
        self.batches[s as usize]
    }

    pub fn skip_successors(&self, s: StateId) -> &[StateId] {
        &self.skip[self.skip_offsets[s as usize] as usize..self.skip_offsets[s as usize + 1] as usize]
    }

    pub fn skip_batch(&self, s: StateId) -> SkipBatch {
        self.skip_batches[s as usize]
    }

    pub fn n_exits(&self) -> usize {
        self.exits.len()
    }

    pub fn exit(&self, id: u32) -> &Exit {
        &self.exits[id as usize]
    }

    pub fn has_exits(&self, s: StateId) -> bool {
        self.single_labels[s as usize] != -1
    }

    /// Iterate the exit ids of `s`, decoding the label batch encoding.
    pub fn exits_of(&self, s: StateId) -> ExitIds<'_> {
        let label = self.single_labels[s as usize];
        let kind = if label == -1 {
            ExitIterKind::Empty
        } else if label >= 0 {
            ExitIterKind::Range(label as u32, label as u32 + 1)
        } else if label == -2 {
            ExitIterKind::Range(
                self.quick_label_batches[s as usize],
                self.quick_label_batches[s as usize + 1],
            )
        } else {
            ExitIterKind::Slow(&self.slow_label_batches[(-label - 3) as usize..])
        };
        ExitIds { kind }
    }

    pub fn depth(&self, s: StateId) -> u32 {
        self.depths[s as usize]
    }

    pub fn root_depth(&self) -> u32 {
        self.root_depth
    }

    pub fn root_state(&self) -> StateId {
        self.root_state
    }

    /// Context-independent root, or 0 when the network has none.
    pub fn ci_root_state(&self) -> StateId {
        self.ci_root_state
    }

    pub fn is_root(&self, s: StateId) -> bool {
        s == self.root_state || s == self.ci_root_state || self.coarticulated_roots.contains(&s)
    }

    pub fn coarticulated_roots(&self) -> &FxHashSet<StateId> {
        &self.coarticulated_roots
    }

    pub fn is_unpushed_root(&self, s: StateId) -> bool {
        s == self.root_state
            || s == self.ci_root_state
            || self.unpushed_coarticulated_roots.contains(&s)
    }

    pub fn uncoarticulated_word_end_states(&self) -> &[StateId] {
        &self.uncoarticulated_word_end_states
    }

    pub fn transit_description(&self, s: StateId) -> Transit {
        self.root_transit_descriptions
            .get(&s)
            .copied()
            .unwrap_or(NO_TRANSIT)
    }

    /// The unique root carrying the requested boundary coarticulation.
    /// `None` when no root matches or the match is ambiguous.
    pub fn root_for_coarticulation(&self, transit: Transit) -> Option<StateId> {
        if transit == NO_TRANSIT {
            return Some(self.root_state);
        }
        let mut found = None;
        for (&state, &desc) in &self.root_transit_descriptions {
            if desc == transit {
                if found.is_some() {
                    return None;
                }
                found = Some(state);
            }
        }
        found
    }
}

enum ExitIterKind<'a> {
    Empty,
    Range(u32, u32),
    Slow(&'a [i32]),
}

pub struct ExitIds<'a> {
    kind: ExitIterKind<'a>,
}

impl<'a> Iterator for ExitIds<'a> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        match &mut self.kind {
            ExitIterKind::Empty => None,
            ExitIterKind::Range(begin, end) => {
                if begin < end {
                    let id = *begin;
                    *begin += 1;
                    Some(id)
                } else {
                    None
                }
            }
            ExitIterKind::Slow(rest) => {
                let id = rest.first().copied()?;
                if id < 0 {
                    None
                } else {
                    *rest = &rest[1..];
                    Some(id as u32)
                }
            }
        }
    }
}

/// Builds a [`Network`]. States are added one by one; transitions, exits and
/// root annotations refer to the returned ids. `build` runs the batch
/// analysis and depth computation.
pub struct NetworkBuilder {
    states: Vec<StateDesc>,
    transition_models: Vec<TransitionModel>,
    succ: Vec<Vec<StateId>>,
    exits: Vec<Exit>,
    state_exits: Vec<Vec<u32>>,
    root_state: StateId,
    ci_root_state: StateId,
    coarticulated_roots: FxHashSet<StateId>,
    unpushed_coarticulated_roots: FxHashSet<StateId>,
    uncoarticulated_word_end_states: Vec<StateId>,
    root_transit_descriptions: FxHashMap<StateId, Transit>,
}

impl Default for NetworkBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkBuilder {
    pub fn new() -> Self {
        let invalid = StateDesc {
            mixture: 0,
            transition_model: 0,
        };
        Self {
            states: vec![invalid],
            transition_models: Vec::new(),
            succ: vec![Vec::new()],
            exits: Vec::new(),
            state_exits: vec![Vec::new()],
            root_state: 0,
            ci_root_state: 0,
            coarticulated_roots: FxHashSet::default(),
            unpushed_coarticulated_roots: FxHashSet::default(),
            uncoarticulated_word_end_states: Vec::new(),
            root_transit_descriptions: FxHashMap::default(),
        }
    }

    pub fn add_transition_model(&mut self, model: TransitionModel) -> u32 {
        self.transition_models.push(model);
        self.transition_models.len() as u32 - 1
    }

    pub fn add_state(&mut self, mixture: MixtureId, transition_model: u32) -> StateId {
        self.states.push(StateDesc {
            mixture,
            transition_model,
        });
        self.succ.push(Vec::new());
        self.state_exits.push(Vec::new());
        self.states.len() as StateId - 1
    }

    fn check_state(&self, s: StateId) -> Result<(), NetworkError> {
        if s == 0 || s as usize >= self.states.len() {
            return Err(NetworkError::InvalidState(s));
        }
        Ok(())
    }

    pub fn add_transition(&mut self, from: StateId, to: StateId) -> Result<(), NetworkError> {
        self.check_state(from)?;
        self.check_state(to)?;
        self.succ[from as usize].push(to);
        Ok(())
    }

    pub fn add_exit(
        &mut self,
        state: StateId,
        pronunciation: Option<PronId>,
        transit_state: StateId,
    ) -> Result<u32, NetworkError> {
        self.check_state(state)?;
        self.check_state(transit_state)?;
        let id = self.exits.len() as u32;
        self.exits.push(Exit {
            pronunciation,
            transit_state,
        });
        self.state_exits[state as usize].push(id);
        Ok(id)
    }

    pub fn set_root(&mut self, s: StateId) -> Result<(), NetworkError> {
        self.check_state(s)?;
        self.root_state = s;
        Ok(())
    }

    pub fn set_ci_root(&mut self, s: StateId) -> Result<(), NetworkError> {
        self.check_state(s)?;
        self.ci_root_state = s;
        Ok(())
    }

    /// Register a coarticulated root with its boundary description.
    /// `pushed` roots sit inside the minimized fan-out, before the root
    /// level; unpushed roots are entered directly by word ends.
    pub fn add_coarticulated_root(
        &mut self,
        s: StateId,
        transit: Transit,
        pushed: bool,
    ) -> Result<(), NetworkError> {
        self.check_state(s)?;
        self.coarticulated_roots.insert(s);
        if !pushed {
            self.unpushed_coarticulated_roots.insert(s);
        }
        self.root_transit_descriptions.insert(s, transit);
        Ok(())
    }

    pub fn add_uncoarticulated_word_end(&mut self, s: StateId) -> Result<(), NetworkError> {
        self.check_state(s)?;
        self.uncoarticulated_word_end_states.push(s);
        Ok(())
    }

    pub fn build(mut self) -> Result<Network, NetworkError> {
        if self.root_state == 0 {
            return Err(NetworkError::MissingRoot);
        }
        let n = self.states.len();
        for (s, desc) in self.states.iter().enumerate().skip(1) {
            if desc.transition_model as usize >= self.transition_models.len() {
                let _ = s;
                return Err(NetworkError::MissingTransitionModel(desc.transition_model));
            }
        }

        for list in &mut self.succ {
            list.sort_unstable();
            list.dedup();
        }

        let (succ_offsets, succ) = to_csr(&self.succ);
        let batches: Vec<SuccessorBatch> = self.succ.iter().map(|l| analyze_batch(l)).collect();

        // Second-order successor lists for skip transitions.
        let mut skip_lists: Vec<Vec<StateId>> = vec![Vec::new(); n];
        for s in 1..n {
            let mut targets = Vec::new();
            for &mid in &self.succ[s] {
                targets.extend_from_slice(&self.succ[mid as usize]);
            }
            targets.sort_unstable();
            targets.dedup();
            skip_lists[s] = targets;
        }
        let (skip_offsets, skip) = to_csr(&skip_lists);

        let (depths, root_depth) = self.build_depths()?;

        let mut skip_batches = Vec::with_capacity(n);
        for s in 0..n {
            let boundary = depths[s] == root_depth
                || self.succ[s].iter().any(|&t| depths[t as usize] == root_depth);
            skip_batches.push(if boundary {
                SkipBatch::Forbidden
            } else {
                match analyze_batch(&skip_lists[s]) {
                    SuccessorBatch::Range(a, b) => SkipBatch::Range(a, b),
                    SuccessorBatch::Irregular => SkipBatch::Irregular,
                }
            });
        }

        let (single_labels, quick_label_batches, slow_label_batches) =
            encode_labels(&self.state_exits);

        Ok(Network {
            states: self.states,
            transition_models: self.transition_models,
            succ_offsets,
            succ,
            batches,
            skip_offsets,
            skip,
            skip_batches,
            exits: self.exits,
            single_labels,
            quick_label_batches,
            slow_label_batches,
            depths,
            root_depth,
            root_state: self.root_state,
            ci_root_state: self.ci_root_state,
            coarticulated_roots: self.coarticulated_roots,
            unpushed_coarticulated_roots: self.unpushed_coarticulated_roots,
            uncoarticulated_word_end_states: self.uncoarticulated_word_end_states,
            root_transit_descriptions: self.root_transit_descriptions,
        })
    }

    // Topological depth assignment. Sources (no predecessors) sit at depth
    // 0; conflicts resolve to the minimum. Every transition must lead
    // strictly deeper, so the fan-out of a minimized network ends up above
    // the root level.
    fn build_depths(&self) -> Result<(Vec<u32>, u32), NetworkError> {
        let n = self.states.len();
        let mut in_degree = vec![0u32; n];
        for list in self.succ.iter().skip(1) {
            for &to in list {
                in_degree[to as usize] += 1;
            }
        }

        let mut depths = vec![u32::MAX; n];
        depths[0] = 0;
        let mut queue: Vec<StateId> = (1..n as StateId)
            .filter(|&s| in_degree[s as usize] == 0)
            .collect();
        for &s in &queue {
            depths[s as usize] = 0;
        }

        let mut head = 0;
        while head < queue.len() {
            let s = queue[head];
            head += 1;
            for &to in &self.succ[s as usize] {
                let d = depths[s as usize] + 1;
                if d < depths[to as usize] {
                    depths[to as usize] = d;
                }
                in_degree[to as usize] -= 1;
                if in_degree[to as usize] == 0 {
                    queue.push(to);
                }
            }
        }

        for s in 1..n {
            if in_degree[s] != 0 {
                return Err(NetworkError::Cycle(s as StateId));
            }
        }
        for s in 1..n {
            for &to in &self.succ[s] {
                if depths[to as usize] <= depths[s] {
                    return Err(NetworkError::DepthConflict {
                        from: s as StateId,
                        from_depth: depths[s],
                        to,
                        to_depth: depths[to as usize],
                    });
                }
            }
        }

        let root_depth = depths[self.root_state as usize];
        Ok((depths, root_depth))
    }
}

fn to_csr(lists: &[Vec<StateId>]) -> (Vec<u32>, Vec<StateId>) {
    let mut offsets = Vec::with_capacity(lists.len() + 1);
    let mut flat = Vec::new();
    offsets.push(0);
    for list in lists {
        flat.extend_from_slice(list);
        offsets.push(flat.len() as u32);
    }
    (offsets, flat)
}

fn analyze_batch(list: &[StateId]) -> SuccessorBatch {
    match list {
        [] => SuccessorBatch::Range(0, 0),
        [single] => SuccessorBatch::Range(*single, *single + 1),
        [first, .., last] if (*last - *first) as usize + 1 == list.len() => {
            SuccessorBatch::Range(*first, *last + 1)
        }
        _ => SuccessorBatch::Irregular,
    }
}

fn encode_labels(state_exits: &[Vec<u32>]) -> (Vec<i32>, Vec<u32>, Vec<i32>) {
    let n = state_exits.len();
    let mut single_labels = vec![-1i32; n];
    let mut quick = vec![0u32; n + 1];
    let mut quick_set = vec![false; n + 1];
    let mut slow = Vec::new();
    for (s, exits) in state_exits.iter().enumerate() {
        let mut as_slow = |slow: &mut Vec<i32>| {
            let label = -(slow.len() as i32) - 3;
            slow.extend(exits.iter().map(|&e| e as i32));
            slow.push(-1);
            label
        };
        match exits.as_slice() {
            [] => {}
            [single] => single_labels[s] = *single as i32,
            [first, .., last] if (*last - *first) as usize + 1 == exits.len() => {
                // Neighboring quick states share the boundary slot; on a
                // mismatch the later state falls back to the slow list.
                let (begin, end) = (*first, *last + 1);
                if (!quick_set[s] || quick[s] == begin) && (!quick_set[s + 1] || quick[s + 1] == end)
                {
                    single_labels[s] = -2;
                    quick[s] = begin;
                    quick_set[s] = true;
                    quick[s + 1] = end;
                    quick_set[s + 1] = true;
                } else {
                    single_labels[s] = as_slow(&mut slow);
                }
            }
            _ => {
                single_labels[s] = as_slow(&mut slow);
            }
        }
    }
    (single_labels, quick, slow)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> TransitionModel {
        TransitionModel {
            loop_: 0.5,
            forward: 0.0,
            skip: 1.0,
            exit: 0.0,
        }
    }

    fn linear_network(n: usize) -> (NetworkBuilder, Vec<StateId>) {
        let mut b = NetworkBuilder::new();
        let tm = b.add_transition_model(model());
        let states: Vec<StateId> = (0..n).map(|i| b.add_state(i as u32, tm)).collect();
        for w in states.windows(2) {
            b.add_transition(w[0], w[1]).unwrap();
        }
        b.set_root(states[0]).unwrap();
        (b, states)
    }

    #[test]
    fn contiguous_successors_become_ranges() {
        let (mut b, states) = linear_network(4);
        b.add_exit(states[3], Some(0), states[0]).unwrap();
        let net = b.build().unwrap();
        assert_eq!(net.batch(states[0]), SuccessorBatch::Range(states[1], states[1] + 1));
        assert_eq!(net.successors(states[1]), &[states[2]]);
        // Second-order successors of state 0 is state 2, but state 0 is the
        // root level, so skips out of it are forbidden.
        assert_eq!(net.skip_batch(states[0]), SkipBatch::Forbidden);
        assert_eq!(net.skip_batch(states[1]), SkipBatch::Range(states[3], states[3] + 1));
        assert_eq!(net.skip_successors(states[1]), &[states[3]]);
        assert_eq!(net.depth(states[0]), 0);
        assert_eq!(net.depth(states[3]), 3);
    }

    #[test]
    fn irregular_successors_fall_back_to_csr() {
        let mut b = NetworkBuilder::new();
        let tm = b.add_transition_model(model());
        let s: Vec<StateId> = (0..5).map(|i| b.add_state(i, tm)).collect();
        b.set_root(s[0]).unwrap();
        b.add_transition(s[0], s[1]).unwrap();
        b.add_transition(s[0], s[3]).unwrap(); // gap: s[2] missing
        b.add_transition(s[1], s[2]).unwrap();
        b.add_transition(s[3], s[4]).unwrap();
        let net = b.build().unwrap();
        assert_eq!(net.batch(s[0]), SuccessorBatch::Irregular);
        assert_eq!(net.successors(s[0]), &[s[1], s[3]]);
    }

    #[test]
    fn label_batches_cover_all_encodings() {
        let mut b = NetworkBuilder::new();
        let tm = b.add_transition_model(model());
        let s: Vec<StateId> = (0..4).map(|i| b.add_state(i, tm)).collect();
        b.set_root(s[0]).unwrap();
        for i in 0..3 {
            b.add_transition(s[i], s[i + 1]).unwrap();
        }
        let e0 = b.add_exit(s[1], Some(0), s[0]).unwrap();
        // Interleave so state 3's exits are non-contiguous.
        let e1 = b.add_exit(s[3], Some(1), s[0]).unwrap();
        let e2 = b.add_exit(s[2], Some(2), s[0]).unwrap();
        let e3 = b.add_exit(s[2], Some(3), s[0]).unwrap();
        let e4 = b.add_exit(s[3], Some(4), s[0]).unwrap();
        let net = b.build().unwrap();
        assert!(!net.has_exits(s[0]));
        assert_eq!(net.exits_of(s[0]).collect::<Vec<_>>(), Vec::<u32>::new());
        assert_eq!(net.exits_of(s[1]).collect::<Vec<_>>(), vec![e0]);
        assert_eq!(net.exits_of(s[2]).collect::<Vec<_>>(), vec![e2, e3]);
        assert_eq!(net.exits_of(s[3]).collect::<Vec<_>>(), vec![e1, e4]);
        assert_eq!(net.exit(e2).pronunciation, Some(2));
    }

    #[test]
    fn pushed_fanout_sits_above_the_root_level() {
        let mut b = NetworkBuilder::new();
        let tm = b.add_transition_model(model());
        let fanout = b.add_state(0, tm);
        let root = b.add_state(1, tm);
        let inner = b.add_state(2, tm);
        b.add_transition(fanout, root).unwrap();
        b.add_transition(root, inner).unwrap();
        b.set_root(root).unwrap();
        b.add_coarticulated_root(fanout, (3, 4), true).unwrap();
        let net = b.build().unwrap();
        assert_eq!(net.depth(fanout), 0);
        assert_eq!(net.root_depth(), 1);
        assert!(net.depth(fanout) < net.root_depth());
        assert_eq!(net.transit_description(fanout), (3, 4));
        assert_eq!(net.root_for_coarticulation((3, 4)), Some(fanout));
        assert_eq!(net.root_for_coarticulation(NO_TRANSIT), Some(root));
        assert_eq!(net.root_for_coarticulation((9, 9)), None);
    }

    #[test]
    fn cycles_are_rejected() {
        let (mut b, states) = linear_network(3);
        b.add_transition(states[2], states[0]).unwrap();
        assert!(matches!(b.build(), Err(NetworkError::Cycle(_))));
    }
}
