use crate::arena::{
    current_effect, effect_arena_insert, effect_arena_remove, set_effect_parent,
    CurrentEffectGuard, EffectCallback, EffectId,
};

/// Run `f` as a reactive effect.
///
/// The body executes immediately with its handle on top of the active-effect
/// stack: every cell (or store key) it reads subscribes it, and any later
/// write to one of those cells tears the effect down (sub-effects, then
/// cleanups) and runs the body again, re-tracking from scratch.
///
/// Only the synchronous body is tracked. Work the body defers elsewhere -
/// a spawned thread, a queued task - runs with no active effect and reads
/// nothing reactively.
///
/// Effects created here are roots: they live until [`reset`](crate::reset)
/// and are never owned by an enclosing effect. Ownership is opted into with
/// [`EffectScope::sub_effect`].
pub fn effect<F>(f: F)
where
    F: FnMut(&EffectScope) + Send + 'static,
{
    let id = effect_arena_insert(Box::new(f));
    execute_body(id);
}

/// Register a teardown callback on the nearest active effect.
///
/// The callback runs exactly once, before the effect's next re-run or when
/// the effect is disposed.
///
/// # Panics
/// Panics if no effect is active: registering teardown with no owner is a
/// programming error with no other observable symptom, so it fails fast.
pub fn on_cleanup<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    let Some(id) = current_effect() else {
        panic!("on_cleanup called while no effect is active");
    };
    id.push_cleanup(Box::new(f));
}

/// Run `f` with dependency tracking suspended.
///
/// Cell and store reads inside `f` do not subscribe the enclosing effect.
pub fn untracked<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let _frame = CurrentEffectGuard::new(None);
    f()
}

/// Handle to the running effect, passed to every effect body.
///
/// The scope is how a body ties resources to its own lifetime: cleanups run
/// before the next re-run, and sub-effects are torn down (recursively,
/// children first) whenever this effect re-runs or is reset.
pub struct EffectScope {
    id: EffectId,
}

impl EffectScope {
    pub(crate) fn new(id: EffectId) -> Self {
        Self { id }
    }

    /// Register a teardown callback on this effect. See [`on_cleanup`].
    pub fn on_cleanup<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.id.push_cleanup(Box::new(f));
    }

    /// Spawn a nested effect owned by this one and run it immediately.
    ///
    /// The child (and, recursively, its own sub-effects) is disposed before
    /// this effect re-runs: cleanups fire deepest-first and every handle is
    /// removed from every subscriber set it appears in. A typical body
    /// re-creates its sub-effects on each run.
    pub fn sub_effect<F>(&self, f: F)
    where
        F: FnMut(&EffectScope) + Send + 'static,
    {
        let child = effect_arena_insert(Box::new(f));
        set_effect_parent(child, self.id);
        self.id.add_child(child);
        execute_body(child);
    }

    pub(crate) fn id(&self) -> EffectId {
        self.id
    }
}

/// Tear an effect down and run its body again. Invoked by write dispatch for
/// every notified subscriber.
pub(crate) fn rerun_effect(id: EffectId) {
    prepare_rerun(id);
    execute_body(id);
}

/// The teardown half of a re-run: dispose the sub-effect subtree, run and
/// clear this effect's own cleanups, and unsubscribe it from every cell it
/// read, so the next run re-tracks from a blank slate.
fn prepare_rerun(id: EffectId) {
    dispose_children(id);
    run_cleanups(id);
    unsubscribe_sources(id);
}

/// Run the body of `id`, honoring latched re-run requests.
///
/// A body cannot be re-entered while it is executing (`FnMut` is exclusive,
/// and the callback is physically out of the arena). When a dispatch lands
/// on an effect that is mid-run - the one-shot self-trigger - the request is
/// latched instead, and this loop performs the extra teardown-and-run as
/// soon as the in-flight body returns, still inside the same outer dispatch.
pub(crate) fn execute_body(id: EffectId) {
    loop {
        let Some(callback) = id.take_callback() else {
            if id.exists() {
                cov_mark::hit!(reentrant_rerun_deferred);
                id.request_rerun();
            }
            return;
        };

        {
            let mut body = BodyGuard {
                id,
                callback: Some(callback),
            };
            let _active = CurrentEffectGuard::new(Some(id));
            body.run();
            // BodyGuard restores the callback even if the body panics.
        }

        if !id.take_rerun_request() {
            break;
        }
        log::trace!("effect {id:?}: deferred self-triggered re-run");
        prepare_rerun(id);
    }

    // The dispatch that set the latch has fully unwound by the time this
    // loop exits; the next outer write gets a fresh self-trigger allowance.
    id.set_self_triggered(false);
}

/// Dispose the entire sub-effect subtree of `id` (but not `id` itself).
pub(crate) fn dispose_children(id: EffectId) {
    for child in id.take_children() {
        dispose_subtree(child);
    }
}

/// Dispose `id` and everything it owns, deepest-first: grandchild cleanups
/// run before child cleanups, which run before this effect's own. Each
/// disposed effect is unsubscribed from every cell and removed from the
/// arena along with its ownership links.
pub(crate) fn dispose_subtree(id: EffectId) {
    dispose_children(id);
    run_cleanups(id);
    unsubscribe_sources(id);
    effect_arena_remove(id);
}

/// Run and clear the cleanups of `id`, in registration order.
///
/// A panicking cleanup propagates and aborts the remaining teardown; the
/// cleanups after it are dropped unrun. Teardown is not best-effort here -
/// see the crate docs for the trade-off.
fn run_cleanups(id: EffectId) {
    for cleanup in id.take_cleanups() {
        cleanup();
    }
}

fn unsubscribe_sources(id: EffectId) {
    for cell_id in id.take_sources() {
        cell_id.remove_subscriber(id);
    }
}

/// Restores an effect's body to the arena on drop, so a panicking body does
/// not leave the effect permanently bodyless.
struct BodyGuard {
    id: EffectId,
    callback: Option<EffectCallback>,
}

impl BodyGuard {
    fn run(&mut self) {
        if let Some(callback) = &mut self.callback {
            callback(&EffectScope::new(self.id));
        }
    }
}

impl Drop for BodyGuard {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            self.id.restore_callback(callback);
        }
    }
}
