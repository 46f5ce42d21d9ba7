// Cell arena - storage for reactive cell metadata
//
// A cell's *value* lives with whoever owns the cell handle (`State<T>` keeps
// it inline, the store bridge keeps it in the backing map). The arena only
// stores the reactive bookkeeping: which effects are subscribed to the cell.
//
// Subscriber sets are insertion-ordered (`IndexSet`): a write notifies
// subscribers in the order they first read the cell, and that order is part
// of the engine's contract.
//
// CellId carries a generation stamp. Slab slots are reused after removal, so
// a bare index could silently alias a newer cell; the stamp makes any access
// through a stale handle a no-op instead.

use std::sync::atomic::{AtomicU32, Ordering};

use indexmap::IndexSet;
use parking_lot::RwLock;
use slab::Slab;

use super::effect_arena::{current_effect, EffectId};
use crate::hash::FastHashBuilder;

/// Global cell arena - stores subscriber metadata for every live cell.
static CELL_ARENA: RwLock<Slab<CellMetadata>> = RwLock::new(Slab::new());

/// Monotonic generation counter stamped onto every inserted cell.
static CELL_GENERATION: AtomicU32 = AtomicU32::new(0);

/// Handle to a cell's metadata in the arena.
///
/// Copyable and generation-stamped: if the cell has been removed (and its
/// slot possibly reused), every operation through the old handle is a no-op
/// and `with` returns `None`.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct CellId {
    slot: u32,
    generation: u32,
}

impl CellId {
    /// Access the cell metadata with a closure (read lock on the arena).
    ///
    /// Returns `None` if the cell has been removed (stale access).
    pub fn with<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&CellMetadata) -> R,
    {
        let arena = CELL_ARENA.read();
        arena
            .get(self.slot as usize)
            .filter(|metadata| metadata.generation == self.generation)
            .map(f)
    }

    /// Register the currently-active effect (if any) as a subscriber.
    ///
    /// This is the read half of implicit dependency tracking: reading a
    /// cell's value while an effect executes subscribes that effect. Reads
    /// outside any effect have no side effect.
    pub fn track_dependency(self) {
        if let Some(effect_id) = current_effect() {
            effect_id.add_source(self);
            self.add_subscriber(effect_id);
        }
    }

    /// Add a subscriber. Duplicates are ignored; first-insertion order is
    /// preserved for notification.
    pub fn add_subscriber(self, effect_id: EffectId) {
        self.with(|metadata| {
            metadata.subscribers.write().insert(effect_id);
        });
    }

    /// Remove a subscriber, keeping the relative order of the rest.
    pub fn remove_subscriber(self, effect_id: EffectId) {
        self.with(|metadata| {
            metadata.subscribers.write().shift_remove(&effect_id);
        });
    }

    /// Whether `effect_id` is currently subscribed. Stale cells have no
    /// subscribers.
    pub fn has_subscriber(self, effect_id: EffectId) -> bool {
        self.with(|metadata| metadata.subscribers.read().contains(&effect_id))
            .unwrap_or(false)
    }

    /// Materialize the subscriber set, in insertion order.
    ///
    /// Write dispatch iterates this snapshot rather than the live set:
    /// re-running a subscriber mutates the set (unsubscribe + re-read), and
    /// that must not change the membership of the dispatch already underway.
    pub fn subscriber_snapshot(self) -> Vec<EffectId> {
        self.with(|metadata| metadata.subscribers.read().iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of current subscribers.
    pub fn subscriber_count(self) -> usize {
        self.with(|metadata| metadata.subscribers.read().len())
            .unwrap_or(0)
    }
}

/// Per-cell reactive metadata: the set of effects that read this cell during
/// their most recent run.
#[derive(Debug)]
pub struct CellMetadata {
    generation: u32,
    pub(crate) subscribers: RwLock<IndexSet<EffectId, FastHashBuilder>>,
}

impl CellMetadata {
    fn new(generation: u32) -> Self {
        Self {
            generation,
            subscribers: RwLock::new(IndexSet::with_hasher(FastHashBuilder)),
        }
    }
}

/// Allocate a fresh cell and return its handle.
pub fn cell_arena_insert() -> CellId {
    let generation = CELL_GENERATION.fetch_add(1, Ordering::Relaxed);
    let mut arena = CELL_ARENA.write();
    let slot = arena.insert(CellMetadata::new(generation)) as u32;
    CellId { slot, generation }
}

/// Remove a cell from the arena. Stale handles are ignored.
pub fn cell_arena_remove(id: CellId) -> Option<CellMetadata> {
    let mut arena = CELL_ARENA.write();
    match arena.get(id.slot as usize) {
        Some(metadata) if metadata.generation == id.generation => {
            Some(arena.remove(id.slot as usize))
        }
        _ => None,
    }
}

/// Drop every subscription in the arena without removing the cells
/// themselves. Used by `reset`: cell handles owned by callers stay valid,
/// but no disposed effect may linger in any subscriber set.
pub fn clear_all_subscribers() {
    let arena = CELL_ARENA.read();
    for (_, metadata) in arena.iter() {
        metadata.subscribers.write().clear();
    }
}
