// Effect arena - storage for effect metadata and the active-effect stack
//
// EffectMetadata holds everything an effect owns:
// - callback: the body, taken out of the arena while it runs so a re-entrant
//   dispatch never deadlocks on the metadata lock
// - sources: the cells the effect read during its most recent run
// - cleanups: teardown callbacks registered by the body, drained and invoked
//   before every re-run and on disposal
// - rerun_requested / self_triggered: latches for the one-shot self-trigger
//   protocol (see `crate::effect`)
//
// Parent/child ownership between effects lives in separate lock-free maps
// (EFFECT_PARENT / EFFECT_CHILDREN) rather than in the metadata itself.
//
// The "active-effect stack" of the tracking model is the chain of nested
// CurrentEffectGuard frames on the running thread: each guard saves the
// previous top and restores it on drop, and `current_effect()` reads the
// innermost frame.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::LazyLock;

use indexmap::IndexSet;
use papaya::HashMap as PapayaHashMap;
use parking_lot::{Mutex, RwLock};
use slab::Slab;

use super::cell_arena::CellId;
use crate::effect::EffectScope;
use crate::hash::FastHashBuilder;

/// An effect body. Receives a scope bound to its own handle through which it
/// can register cleanups and spawn owned sub-effects.
pub type EffectCallback = Box<dyn FnMut(&EffectScope) + Send>;

/// A teardown callback registered by an effect body.
pub type Cleanup = Box<dyn FnOnce() + Send>;

/// Global effect arena - stores metadata for every live effect.
static EFFECT_ARENA: RwLock<Slab<EffectMetadata>> = RwLock::new(Slab::new());

/// Monotonic generation counter stamped onto every inserted effect.
static EFFECT_GENERATION: AtomicU32 = AtomicU32::new(0);

// Global map: child EffectId -> parent EffectId.
static EFFECT_PARENT: LazyLock<PapayaHashMap<EffectId, EffectId>> =
    LazyLock::new(PapayaHashMap::new);

// Global map: parent EffectId -> owned children, in registration order.
static EFFECT_CHILDREN: LazyLock<PapayaHashMap<EffectId, RwLock<Vec<EffectId>>>> =
    LazyLock::new(PapayaHashMap::new);

thread_local! {
    // Top of the active-effect stack for this thread.
    static CURRENT_EFFECT: RefCell<Option<EffectId>> = const { RefCell::new(None) };
}

/// The effect currently on top of the active-effect stack, if any.
pub fn current_effect() -> Option<EffectId> {
    CURRENT_EFFECT.with(|current| *current.borrow())
}

fn set_current_effect(effect_id: Option<EffectId>) -> Option<EffectId> {
    CURRENT_EFFECT.with(|current| current.replace(effect_id))
}

/// RAII frame of the active-effect stack.
///
/// Pushes `new_top` on construction and restores the previous top on drop,
/// so the stack stays balanced even when a body panics.
pub struct CurrentEffectGuard {
    previous: Option<EffectId>,
}

impl CurrentEffectGuard {
    pub fn new(new_top: Option<EffectId>) -> Self {
        let previous = set_current_effect(new_top);
        Self { previous }
    }
}

impl Drop for CurrentEffectGuard {
    fn drop(&mut self) {
        set_current_effect(self.previous);
    }
}

/// Handle to an effect's metadata in the arena.
///
/// Copyable and generation-stamped; operations through a handle whose effect
/// was disposed are no-ops (see `CellId` for the rationale).
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct EffectId {
    slot: u32,
    generation: u32,
}

impl EffectId {
    /// Access the effect metadata with a closure (read lock on the arena).
    ///
    /// Returns `None` if the effect has been disposed (stale access).
    pub fn with<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&EffectMetadata) -> R,
    {
        let arena = EFFECT_ARENA.read();
        arena
            .get(self.slot as usize)
            .filter(|metadata| metadata.generation == self.generation)
            .map(f)
    }

    /// Whether this effect is still live in the arena.
    pub fn exists(self) -> bool {
        self.with(|_| ()).is_some()
    }

    /// Record a cell this effect read during its current run.
    pub fn add_source(self, source: CellId) {
        self.with(|metadata| {
            metadata.sources.write().insert(source);
        });
    }

    /// Forget a single source (used when a cell is dropped out from under
    /// its subscribers).
    pub fn remove_source(self, source: CellId) {
        self.with(|metadata| {
            metadata.sources.write().shift_remove(&source);
        });
    }

    /// Drain and return every recorded source.
    pub fn take_sources(self) -> Vec<CellId> {
        self.with(|metadata| metadata.sources.write().drain(..).collect())
            .unwrap_or_default()
    }

    /// Number of cells this effect currently depends on.
    pub fn source_count(self) -> usize {
        self.with(|metadata| metadata.sources.read().len())
            .unwrap_or(0)
    }

    /// Append a cleanup to run before the next re-run or disposal.
    pub fn push_cleanup(self, cleanup: Cleanup) {
        self.with(|metadata| {
            metadata.cleanups.lock().push(cleanup);
        });
    }

    /// Drain the registered cleanups, in registration order.
    pub fn take_cleanups(self) -> Vec<Cleanup> {
        self.with(|metadata| std::mem::take(&mut *metadata.cleanups.lock()))
            .unwrap_or_default()
    }

    /// Take the body out of the arena for execution.
    ///
    /// Returns `None` both for a stale handle and while the body is already
    /// out (i.e. mid-run on this thread); callers use `exists` to tell the
    /// two apart.
    pub fn take_callback(self) -> Option<EffectCallback> {
        self.with(|metadata| metadata.callback.lock().take())
            .flatten()
    }

    /// Put a body back after execution. No-op if the effect was disposed
    /// while it ran.
    pub fn restore_callback(self, callback: EffectCallback) {
        self.with(|metadata| {
            *metadata.callback.lock() = Some(callback);
        });
    }

    /// Latch a re-run request for the run loop that currently owns the body.
    pub fn request_rerun(self) {
        self.with(|metadata| metadata.rerun_requested.store(true, Ordering::Release));
    }

    /// Consume the pending re-run request, if any.
    pub fn take_rerun_request(self) -> bool {
        self.with(|metadata| metadata.rerun_requested.swap(false, Ordering::AcqRel))
            .unwrap_or(false)
    }

    /// Whether this effect already used its one self-trigger for the
    /// dispatch in flight.
    pub fn self_triggered(self) -> bool {
        self.with(|metadata| metadata.self_triggered.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn set_self_triggered(self, fired: bool) {
        self.with(|metadata| metadata.self_triggered.store(fired, Ordering::Release));
    }

    /// The effect that owns this one, if it was spawned as a sub-effect.
    pub fn parent(self) -> Option<EffectId> {
        EFFECT_PARENT.pin().get(&self).copied()
    }

    /// Record `child` as owned by this effect.
    pub fn add_child(self, child: EffectId) {
        EFFECT_CHILDREN
            .pin()
            .get_or_insert_with(self, || RwLock::new(Vec::new()))
            .write()
            .push(child);
    }

    /// Detach and return this effect's children, in registration order.
    pub fn take_children(self) -> Vec<EffectId> {
        let guard = EFFECT_CHILDREN.pin();
        match guard.get(&self) {
            Some(children) => {
                let children = std::mem::take(&mut *children.write());
                guard.remove(&self);
                children
            }
            None => Vec::new(),
        }
    }

    /// Number of live children owned by this effect.
    pub fn child_count(self) -> usize {
        EFFECT_CHILDREN
            .pin()
            .get(&self)
            .map(|children| children.read().len())
            .unwrap_or(0)
    }

    /// A unique handle that was never inserted into the arena. Test-only.
    #[cfg(test)]
    pub(crate) fn dangling() -> EffectId {
        EffectId {
            slot: u32::MAX,
            generation: EFFECT_GENERATION.fetch_add(1, Ordering::Relaxed),
        }
    }
}

/// Metadata for a single effect.
pub struct EffectMetadata {
    generation: u32,

    /// The effect body. `None` while the body is out being executed.
    pub(crate) callback: Mutex<Option<EffectCallback>>,

    /// Cells read during the most recent run, in read order.
    pub(crate) sources: RwLock<IndexSet<CellId, FastHashBuilder>>,

    /// Teardown callbacks registered during the most recent run.
    pub(crate) cleanups: Mutex<Vec<Cleanup>>,

    /// Set when a dispatch tried to re-run this effect while its body was
    /// already executing; the owning run loop performs the re-run once the
    /// body returns.
    pub(crate) rerun_requested: AtomicBool,

    /// One-shot latch: this effect already self-triggered during the
    /// dispatch in flight. Cleared when its run loop fully unwinds.
    pub(crate) self_triggered: AtomicBool,
}

impl EffectMetadata {
    fn new(generation: u32, callback: EffectCallback) -> Self {
        Self {
            generation,
            callback: Mutex::new(Some(callback)),
            sources: RwLock::new(IndexSet::with_hasher(FastHashBuilder)),
            cleanups: Mutex::new(Vec::new()),
            rerun_requested: AtomicBool::new(false),
            self_triggered: AtomicBool::new(false),
        }
    }
}

/// Allocate a fresh effect holding `callback` and return its handle.
pub fn effect_arena_insert(callback: EffectCallback) -> EffectId {
    let generation = EFFECT_GENERATION.fetch_add(1, Ordering::Relaxed);
    let mut arena = EFFECT_ARENA.write();
    let slot = arena.insert(EffectMetadata::new(generation, callback)) as u32;
    EffectId { slot, generation }
}

/// Record the ownership link for a freshly spawned sub-effect.
pub fn set_effect_parent(child: EffectId, parent: EffectId) {
    EFFECT_PARENT.pin().insert(child, parent);
}

/// Remove an effect from the arena together with its ownership bookkeeping.
/// Stale handles are ignored.
pub fn effect_arena_remove(id: EffectId) -> Option<EffectMetadata> {
    EFFECT_PARENT.pin().remove(&id);
    EFFECT_CHILDREN.pin().remove(&id);

    let mut arena = EFFECT_ARENA.write();
    match arena.get(id.slot as usize) {
        Some(metadata) if metadata.generation == id.generation => {
            Some(arena.remove(id.slot as usize))
        }
        _ => None,
    }
}

/// Every live effect that has no parent, i.e. the roots of the ownership
/// forest. Disposal during `reset` starts here so that nested cleanups run
/// children-first.
pub fn effect_arena_roots() -> Vec<EffectId> {
    let arena = EFFECT_ARENA.read();
    arena
        .iter()
        .map(|(slot, metadata)| EffectId {
            slot: slot as u32,
            generation: metadata.generation,
        })
        .filter(|id| id.parent().is_none())
        .collect()
}

/// Wipe the arena and the ownership maps without running any cleanups.
/// Backstop for `reset`: anything a reset-time cleanup managed to spawn is
/// discarded rather than leaked.
pub fn effect_arena_clear() {
    EFFECT_ARENA.write().clear();
    EFFECT_PARENT.pin().clear();
    EFFECT_CHILDREN.pin().clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tests that insert into the process-wide arena serialize with the
    // tests that call `reset()`; the guard test only touches the
    // thread-local stack and needs no lock.

    #[test]
    fn stale_access_is_a_no_op() {
        let _serial = crate::tests::engine_lock();

        let id = effect_arena_insert(Box::new(|_| {}));
        effect_arena_remove(id);

        assert!(!id.exists());
        assert!(id.take_callback().is_none());
        assert!(!id.take_rerun_request());
        assert_eq!(id.take_sources(), Vec::new());
        assert!(effect_arena_remove(id).is_none());
    }

    #[test]
    fn current_effect_guard_restores_on_panic() {
        let outer = EffectId::dangling();
        let inner = EffectId::dangling();

        let _outer_frame = CurrentEffectGuard::new(Some(outer));
        assert_eq!(current_effect(), Some(outer));

        let result = std::panic::catch_unwind(|| {
            let _inner_frame = CurrentEffectGuard::new(Some(inner));
            assert_eq!(current_effect(), Some(inner));
            panic!("unwind through the guard");
        });

        assert!(result.is_err());
        assert_eq!(current_effect(), Some(outer));
    }

    #[test]
    fn children_detach_in_registration_order() {
        let _serial = crate::tests::engine_lock();

        let parent = effect_arena_insert(Box::new(|_| {}));
        let first = effect_arena_insert(Box::new(|_| {}));
        let second = effect_arena_insert(Box::new(|_| {}));

        set_effect_parent(first, parent);
        parent.add_child(first);
        set_effect_parent(second, parent);
        parent.add_child(second);

        assert_eq!(first.parent(), Some(parent));
        assert_eq!(parent.child_count(), 2);
        assert_eq!(parent.take_children(), vec![first, second]);
        assert_eq!(parent.child_count(), 0);

        effect_arena_remove(first);
        effect_arena_remove(second);
        effect_arena_remove(parent);
    }

    #[test]
    fn callback_round_trips_through_the_arena() {
        let _serial = crate::tests::engine_lock();

        let id = effect_arena_insert(Box::new(|_| {}));

        let callback = id.take_callback().expect("body present after insert");
        // Mid-run the slot is empty.
        assert!(id.take_callback().is_none());
        assert!(id.exists());
        id.restore_callback(callback);
        assert!(id.take_callback().is_some());

        effect_arena_remove(id);
    }
}
