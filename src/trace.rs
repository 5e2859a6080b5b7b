use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::lm::History;
use crate::{PronId, Score, ScoreVector, StateId, TimeframeIndex, Transit, NO_TRANSIT};

pub type TraceRef = Rc<RefCell<Trace>>;

/// Backtrace node. `predecessor` points towards the sentence start;
/// `sibling` threads recombined alternatives for lattice construction.
#[derive(Debug)]
pub struct Trace {
    pub predecessor: Option<TraceRef>,
    pub sibling: Option<TraceRef>,
    pub pronunciation: Option<PronId>,
    pub time: TimeframeIndex,
    pub score: ScoreVector,
    pub transit: Transit,
}

impl Trace {
    pub fn root(time: TimeframeIndex, score: ScoreVector) -> TraceRef {
        Rc::new(RefCell::new(Trace {
            predecessor: None,
            sibling: None,
            pronunciation: None,
            time,
            score,
            transit: NO_TRANSIT,
        }))
    }

    pub fn extend(
        predecessor: TraceRef,
        pronunciation: Option<PronId>,
        time: TimeframeIndex,
        score: ScoreVector,
        transit: Transit,
    ) -> TraceRef {
        Rc::new(RefCell::new(Trace {
            predecessor: Some(predecessor),
            sibling: None,
            pronunciation,
            time,
            score,
            transit,
        }))
    }
}

/// Handle into the [`TraceManager`]. The high bit marks ids that carry a
/// pushed-boundary modification; the low bits index either the item table
/// or the modification table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraceId(u32);

const MODIFIED_FLAG: u32 = 1 << 31;

impl TraceId {
    fn item(index: usize) -> TraceId {
        debug_assert!((index as u32) & MODIFIED_FLAG == 0);
        TraceId(index as u32)
    }

    fn modified(index: usize) -> TraceId {
        debug_assert!((index as u32) & MODIFIED_FLAG == 0);
        TraceId(index as u32 | MODIFIED_FLAG)
    }

    #[cfg(test)]
    pub(crate) fn placeholder() -> TraceId {
        TraceId(0)
    }
}

/// One entry per live (trace, LM context) pair.
#[derive(Debug, Clone)]
pub struct TraceItem {
    pub trace: TraceRef,
    pub history: History,
    pub lookahead_history: History,
}

/// Pushed-boundary correction attached to a [`TraceId`]: the word boundary
/// recorded in the trace is off by `time_offset` frames and
/// `acoustic_offset` score, and the true boundary state is `state`.
#[derive(Debug, Clone, Copy)]
pub struct Modification {
    base: u32,
    pub time_offset: i32,
    pub acoustic_offset: Score,
    pub state: StateId,
}

/// Arena of trace items with the modification side table. Compacted by
/// reachability once per frame.
#[derive(Debug, Default)]
pub struct TraceManager {
    items: Vec<TraceItem>,
    mods: Vec<Modification>,
}

impl TraceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn n_items(&self) -> usize {
        self.items.len()
    }

    pub fn add(&mut self, trace: TraceRef, history: History, lookahead_history: History) -> TraceId {
        self.items.push(TraceItem {
            trace,
            history,
            lookahead_history,
        });
        TraceId::item(self.items.len() - 1)
    }

    pub fn is_modified(&self, id: TraceId) -> bool {
        id.0 & MODIFIED_FLAG != 0
    }

    /// The id stripped of its modification.
    pub fn unmodified(&self, id: TraceId) -> TraceId {
        if self.is_modified(id) {
            TraceId::item(self.mods[(id.0 & !MODIFIED_FLAG) as usize].base as usize)
        } else {
            id
        }
    }

    pub fn trace_item(&self, id: TraceId) -> &TraceItem {
        &self.items[self.unmodified(id).0 as usize]
    }

    pub fn modification(&self, id: TraceId) -> Option<Modification> {
        if self.is_modified(id) {
            Some(self.mods[(id.0 & !MODIFIED_FLAG) as usize])
        } else {
            None
        }
    }

    /// Attach a pushed-boundary correction. `id` must be unmodified.
    pub fn modify(
        &mut self,
        id: TraceId,
        time_offset: i32,
        acoustic_offset: Score,
        state: StateId,
    ) -> TraceId {
        debug_assert!(!self.is_modified(id));
        self.mods.push(Modification {
            base: id.0,
            time_offset,
            acoustic_offset,
            state,
        });
        TraceId::modified(self.mods.len() - 1)
    }

    /// Drop every item and modification not in `live` and return the
    /// remapping from old to new ids.
    pub fn cleanup(&mut self, live: &FxHashSet<TraceId>) -> FxHashMap<TraceId, TraceId> {
        let mut map = FxHashMap::default();
        let mut items = Vec::new();
        let mut mods = Vec::new();
        let mut item_map: FxHashMap<u32, u32> = FxHashMap::default();

        let mut keep_item = |base: u32, items: &mut Vec<TraceItem>, item_map: &mut FxHashMap<u32, u32>, old: &[TraceItem]| -> u32 {
            *item_map.entry(base).or_insert_with(|| {
                items.push(old[base as usize].clone());
                items.len() as u32 - 1
            })
        };

        let mut live_sorted: Vec<TraceId> = live.iter().copied().collect();
        live_sorted.sort_unstable();
        for id in live_sorted {
            if map.contains_key(&id) {
                continue;
            }
            if self.is_modified(id) {
                let mut m = self.mods[(id.0 & !MODIFIED_FLAG) as usize];
                m.base = keep_item(m.base, &mut items, &mut item_map, &self.items);
                mods.push(m);
                map.insert(id, TraceId::modified(mods.len() - 1));
            } else {
                let new = keep_item(id.0, &mut items, &mut item_map, &self.items);
                map.insert(id, TraceId::item(new as usize));
            }
        }

        self.items = items;
        self.mods = mods;
        map
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.mods.clear();
    }
}

/// One word on the decoded path.
#[derive(Debug, Clone, PartialEq)]
pub struct TracebackItem {
    pub pronunciation: Option<PronId>,
    pub time: TimeframeIndex,
    pub score: ScoreVector,
    pub transit: Transit,
}

/// Unwind the predecessor chain into chronological order.
pub fn traceback(end: &TraceRef) -> Vec<TracebackItem> {
    let mut items = Vec::new();
    let mut current = Some(end.clone());
    while let Some(t) = current {
        let t = t.borrow();
        items.push(TracebackItem {
            pronunciation: t.pronunciation,
            time: t.time,
            score: t.score,
            transit: t.transit,
        });
        current = t.predecessor.clone();
    }
    items.reverse();
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ScoreVector;

    #[test]
    fn modification_round_trip() {
        let mut manager = TraceManager::new();
        let root = Trace::root(0, ScoreVector::default());
        let id = manager.add(root, History(0), History(0));
        assert!(!manager.is_modified(id));

        let modified = manager.modify(id, 3, 1.5, 7);
        assert!(manager.is_modified(modified));
        assert_eq!(manager.unmodified(modified), id);
        let m = manager.modification(modified).unwrap();
        assert_eq!(m.time_offset, 3);
        assert_eq!(m.acoustic_offset, 1.5);
        assert_eq!(m.state, 7);
        assert!(manager.modification(id).is_none());
    }

    #[test]
    fn cleanup_remaps_live_ids() {
        let mut manager = TraceManager::new();
        let mut ids = Vec::new();
        for t in 0..4 {
            let root = Trace::root(t, ScoreVector::default());
            ids.push(manager.add(root, History(t), History(0)));
        }
        let modified = manager.modify(ids[2], 1, 0.0, 0);

        let live: FxHashSet<TraceId> = [ids[1], modified].into_iter().collect();
        let map = manager.cleanup(&live);
        assert_eq!(map.len(), 2);
        assert_eq!(manager.n_items(), 2);

        let new_plain = map[&ids[1]];
        let new_modified = map[&modified];
        assert_eq!(manager.trace_item(new_plain).history, History(1));
        assert_eq!(manager.trace_item(new_modified).history, History(2));
        assert!(manager.is_modified(new_modified));
        assert_eq!(manager.modification(new_modified).unwrap().time_offset, 1);
    }

    #[test]
    fn traceback_is_chronological() {
        let root = Trace::root(0, ScoreVector::default());
        let a = Trace::extend(root, Some(1), 4, ScoreVector::new(2.0, 1.0), NO_TRANSIT);
        let b = Trace::extend(a, Some(2), 9, ScoreVector::new(5.0, 2.0), NO_TRANSIT);
        let items = traceback(&b);
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].pronunciation, None);
        assert_eq!(items[1].pronunciation, Some(1));
        assert_eq!(items[2].time, 9);
    }
}
