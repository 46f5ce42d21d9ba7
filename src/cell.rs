use std::sync::Arc;

use parking_lot::RwLock;

use crate::arena::{cell_arena_insert, cell_arena_remove, current_effect, CellId};

/// A reactive cell: a mutable value whose reads are tracked and whose writes
/// re-run every effect that read it.
///
/// `State` is a cheap clonable handle; clones share one value and one
/// subscriber set. The value itself lives inside the handle - the arena only
/// tracks who is subscribed.
///
/// # Example
/// ```ignore
/// let count = state(0);
/// effect({
///     let count = count.clone();
///     move |_| println!("count is {}", count.get())
/// });
/// count.set(1); // effect re-runs synchronously, before set returns
/// ```
pub struct State<T> {
    inner: Arc<CellInner<T>>,
}

struct CellInner<T> {
    id: CellId,
    value: RwLock<T>,
}

impl<T> State<T> {
    /// Create a cell holding `initial`.
    pub fn new(initial: T) -> Self {
        Self {
            inner: Arc::new(CellInner {
                id: cell_arena_insert(),
                value: RwLock::new(initial),
            }),
        }
    }

    /// Read the value through a borrow, registering the active effect (if
    /// any) as a subscriber.
    ///
    /// The closure runs under the cell's read lock: it must not write this
    /// cell.
    pub fn with<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&T) -> R,
    {
        self.inner.id.track_dependency();
        f(&self.inner.value.read())
    }

    /// Replace the value, then re-run every subscriber.
    ///
    /// There is deliberately no equality short-circuit: writing a value equal
    /// to the current one still notifies. Subscribers run synchronously, in
    /// the order they first read the cell, before `set` returns.
    pub fn set(&self, value: T) {
        *self.inner.value.write() = value;
        notify_subscribers(self.inner.id);
    }

    pub(crate) fn cell_id(&self) -> CellId {
        self.inner.id
    }
}

impl<T: Clone> State<T> {
    /// Read a clone of the value, registering the active effect (if any) as
    /// a subscriber.
    pub fn get(&self) -> T {
        self.with(T::clone)
    }
}

impl<T> Clone for State<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Drop for CellInner<T> {
    fn drop(&mut self) {
        // Last handle gone: prune this cell from every subscriber's source
        // set before the slot is reclaimed.
        for effect_id in self.id.subscriber_snapshot() {
            effect_id.remove_source(self.id);
        }
        cell_arena_remove(self.id);
    }
}

/// Create a reactive cell holding `initial`. Alias for [`State::new`] that
/// mirrors the `effect`/`derived` free functions.
pub fn state<T>(initial: T) -> State<T> {
    State::new(initial)
}

/// Re-run the subscribers of `cell_id` after a write.
///
/// Dispatch contract:
/// - iterate a snapshot of the subscriber set, in insertion order; mutations
///   caused by re-running effects do not affect this dispatch's membership
/// - an effect notifying itself (a write from inside its own body to a cell
///   it read) fires at most once per dispatch; further self-triggers are
///   dropped (`self_triggered` latch, cleared by the effect's run loop)
/// - effects unsubscribed by an earlier iteration of this same dispatch are
///   skipped
/// - each re-run is a full teardown-and-rebuild: sub-effect subtree, then
///   cleanups, then the body, tracked from scratch
pub(crate) fn notify_subscribers(cell_id: CellId) {
    let snapshot = cell_id.subscriber_snapshot();
    if snapshot.is_empty() {
        return;
    }
    log::trace!(
        "cell {cell_id:?}: dispatching to {} subscriber(s)",
        snapshot.len()
    );

    for effect_id in snapshot {
        if current_effect() == Some(effect_id) {
            if effect_id.self_triggered() {
                cov_mark::hit!(self_trigger_suppressed);
                continue;
            }
            cov_mark::hit!(self_trigger_allowed);
            effect_id.set_self_triggered(true);
        }

        // A subscriber re-run earlier in this dispatch may have disposed
        // this effect (sub-effect teardown) or unsubscribed it.
        if !cell_id.has_subscriber(effect_id) {
            cov_mark::hit!(stale_subscriber_skipped);
            continue;
        }

        crate::effect::rerun_effect(effect_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_outside_effects_do_not_subscribe() {
        let _serial = crate::tests::engine_lock();

        let cell = state(7);
        assert_eq!(cell.get(), 7);
        assert_eq!(cell.cell_id().subscriber_count(), 0);

        cell.set(8);
        assert_eq!(cell.get(), 8);
        assert_eq!(cell.cell_id().subscriber_count(), 0);
    }

    #[test]
    fn clones_share_value_and_subscribers() {
        let _serial = crate::tests::engine_lock();

        let cell = state(String::from("a"));
        let alias = cell.clone();
        assert_eq!(cell.cell_id(), alias.cell_id());

        alias.set(String::from("b"));
        assert_eq!(cell.get(), "b");
    }

    #[test]
    fn dropping_last_handle_frees_the_cell() {
        let _serial = crate::tests::engine_lock();

        let cell = state(1u8);
        let id = cell.cell_id();
        let alias = cell.clone();

        drop(cell);
        assert!(id.with(|_| ()).is_some());

        drop(alias);
        assert!(id.with(|_| ()).is_none());
    }
}
