//! Area-of-interest memory and diffing.
//!
//! For each observer the tracker remembers which neighbors were included in
//! the last broadcast and at what position. Diffing the remembered set
//! against the current radius-query result classifies every neighbor as
//! entered, persisted-and-moved, or exited; the memory is replaced
//! atomically once the observer's broadcast for the tick is built.

use hashbrown::HashMap;

use crate::util::vec2::Vec2;
use crate::world::entity::EntityId;

/// Classification of an observer's neighbors for one tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AoiDiff {
    /// Present now, absent from memory: send full state.
    pub entered: Vec<EntityId>,
    /// Present in both with a different position: send a movement delta.
    /// Unmoved persistent neighbors produce nothing.
    pub moved: Vec<EntityId>,
    /// Present in memory, absent now: send a departure notice.
    pub exited: Vec<EntityId>,
}

impl AoiDiff {
    pub fn is_empty(&self) -> bool {
        self.entered.is_empty() && self.moved.is_empty() && self.exited.is_empty()
    }
}

/// Per-observer record of who it last saw and where.
pub struct AoiTracker {
    memory: HashMap<EntityId, HashMap<EntityId, Vec2>>,
}

impl AoiTracker {
    pub fn new() -> Self {
        Self {
            memory: HashMap::new(),
        }
    }

    /// Classify `current` against the observer's memory. Results are
    /// sorted by id so broadcast content is deterministic.
    pub fn diff(&self, observer: EntityId, current: &[(EntityId, Vec2)]) -> AoiDiff {
        let known = self.memory.get(&observer);
        let mut diff = AoiDiff::default();

        for &(id, position) in current {
            match known.and_then(|m| m.get(&id)) {
                None => diff.entered.push(id),
                Some(&last) if last != position => diff.moved.push(id),
                Some(_) => {}
            }
        }

        if let Some(known) = known {
            for &id in known.keys() {
                if !current.iter().any(|&(cur, _)| cur == id) {
                    diff.exited.push(id);
                }
            }
        }

        diff.entered.sort_unstable();
        diff.moved.sort_unstable();
        diff.exited.sort_unstable();
        diff
    }

    /// Replace the observer's memory with the set actually broadcast this
    /// tick. Must happen exactly once per observer per tick, never partially.
    pub fn commit(&mut self, observer: EntityId, current: &[(EntityId, Vec2)]) {
        let entry = self.memory.entry(observer).or_default();
        entry.clear();
        entry.extend(current.iter().copied());
    }

    /// Drop an observer's memory entirely (entity removed).
    pub fn forget(&mut self, observer: EntityId) {
        self.memory.remove(&observer);
    }

    pub fn observer_count(&self) -> usize {
        self.memory.len()
    }

    /// Last broadcast position of `neighbor` as seen by `observer`.
    pub fn remembered(&self, observer: EntityId, neighbor: EntityId) -> Option<Vec2> {
        self.memory.get(&observer)?.get(&neighbor).copied()
    }
}

impl Default for AoiTracker {
    fn default() -> Self {
        Self::new()
    }
}
