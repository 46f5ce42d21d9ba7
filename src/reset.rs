use crate::arena::{clear_all_subscribers, effect_arena_clear, effect_arena_roots};
use crate::effect::dispose_subtree;
use crate::store;

/// Tear the engine back down to its initial, empty state.
///
/// Every live effect tree is disposed depth-first - grandchild cleanups
/// before child cleanups before the root's own - then all bookkeeping is
/// wiped: no cell retains a subscriber, no effect survives, and the store
/// bridge is unsubscribed (its backing map persists; it belongs to the
/// process, not the engine).
///
/// Intended for the seams between independent executions sharing a process:
/// between test cases, or between server requests reusing one engine. After
/// `reset`, writes to previously-depended-on cells re-run nothing.
pub fn reset() {
    log::debug!("resetting reactive engine");

    for root in effect_arena_roots() {
        dispose_subtree(root);
    }

    // Disposal already unsubscribed everything it tore down; these wipes
    // catch whatever reset-time cleanups managed to spawn or subscribe.
    effect_arena_clear();
    clear_all_subscribers();

    store::reset_bridge();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{effect, state};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn reset_severs_all_subscriptions() {
        let _serial = crate::tests::engine_lock();
        reset();

        let cell = state(0);
        let runs = Arc::new(AtomicUsize::new(0));

        let cell_in_body = cell.clone();
        let runs_in_body = runs.clone();
        effect(move |_| {
            cell_in_body.get();
            runs_in_body.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(runs.load(Ordering::Relaxed), 1);
        assert_eq!(cell.cell_id().subscriber_count(), 1);

        reset();
        assert_eq!(cell.cell_id().subscriber_count(), 0);

        cell.set(1);
        assert_eq!(runs.load(Ordering::Relaxed), 1, "disposed effect re-ran");
    }

    #[test]
    fn reset_runs_cleanups_of_live_effects() {
        let _serial = crate::tests::engine_lock();
        reset();

        let cleaned = Arc::new(AtomicUsize::new(0));
        let cleaned_in_body = cleaned.clone();
        effect(move |scope| {
            let cleaned = cleaned_in_body.clone();
            scope.on_cleanup(move || {
                cleaned.fetch_add(1, Ordering::Relaxed);
            });
        });

        assert_eq!(cleaned.load(Ordering::Relaxed), 0);
        reset();
        assert_eq!(cleaned.load(Ordering::Relaxed), 1);

        // A second reset finds nothing left to dispose.
        reset();
        assert_eq!(cleaned.load(Ordering::Relaxed), 1);
    }
}
