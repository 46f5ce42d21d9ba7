//! Process-wide key/value store wired into the dependency graph.
//!
//! The store is an external collaborator with its own lifetime: the backing
//! map outlives [`reset`](crate::reset) and is shared by everything in the
//! process. What ties it into the engine is a notification channel plus one
//! *shadow cell* per accessed key:
//!
//! - every [`get`] announces `(key, value, is_getter = true)` on the channel
//! - every [`set`]/[`delete`]/[`clear`] announces the affected key(s) with
//!   `is_getter = false`
//! - the engine subscribes a single forwarding listener to the channel
//!   (lazily, on the first `get`; idempotently thereafter) which maps the
//!   announcement onto the key's shadow cell - a getter tracks it like a
//!   cell read, anything else dispatches its subscribers like a cell write
//!
//! The net effect: an effect that calls `store::get("k")` re-runs on
//! `store::set("k", ...)` exactly as if it had read a local cell. Deletions
//! and `clear` notify with no value; dependents re-read and observe `None`.
//!
//! Values are [`serde_json::Value`]: the store is the one place in the
//! engine where heterogeneous keys genuinely need a tagged value type, and
//! the raw-map escape hatch ([`with_map`]) exists for bulk serialization.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use slab::Slab;

use crate::arena::{cell_arena_insert, cell_arena_remove, CellId};
use crate::cell::notify_subscribers;
use crate::hash::FastHashBuilder;

/// A store notification listener: `(key, value, is_getter)`.
type Listener = Arc<dyn Fn(&str, Option<&Value>, bool) + Send + Sync>;

/// Process-wide backing map. Persists across `reset`.
static BACKING: LazyLock<RwLock<IndexMap<String, Value>>> =
    LazyLock::new(|| RwLock::new(IndexMap::new()));

/// Notification channel: every store operation announces here.
static LISTENERS: RwLock<Slab<Listener>> = RwLock::new(Slab::new());

/// The engine's forwarding listener, once subscribed. `None` means
/// UNSUBSCRIBED; `reset` takes it back to `None`.
static BRIDGE_LISTENER: Mutex<Option<usize>> = Mutex::new(None);

/// One value-less cell per store key that has been touched. Subscriptions to
/// store keys live on these, in the same arena as ordinary cells.
static SHADOW_CELLS: LazyLock<Mutex<HashMap<String, CellId, FastHashBuilder>>> =
    LazyLock::new(|| Mutex::new(HashMap::with_hasher(FastHashBuilder)));

/// Look up `key`, announcing the read so the active effect (if any)
/// subscribes to the key.
///
/// The first `get` in an engine lifetime subscribes the forwarding listener
/// to the channel; later calls find it already subscribed.
pub fn get(key: &str) -> Option<Value> {
    ensure_subscribed();
    let value = BACKING.read().get(key).cloned();
    notify(key, value.as_ref(), true);
    value
}

/// Write `key`, then re-run every effect subscribed to it.
pub fn set(key: impl Into<String>, value: Value) {
    let key = key.into();
    BACKING.write().insert(key.clone(), value.clone());
    notify(&key, Some(&value), false);
}

/// Remove `key`, reporting whether it was present. Subscribers re-run with
/// no value available.
pub fn delete(key: &str) -> bool {
    let removed = BACKING.write().shift_remove(key).is_some();
    notify(key, None, false);
    removed
}

/// Remove every key, re-running the subscribers of each.
pub fn clear() {
    let keys: Vec<String> = BACKING.write().drain(..).map(|(key, _)| key).collect();
    for key in &keys {
        notify(key, None, false);
    }
}

/// Read-only access to the raw backing map, for bulk inspection or
/// serialization. Does not participate in dependency tracking.
pub fn with_map<F, R>(f: F) -> R
where
    F: FnOnce(&IndexMap<String, Value>) -> R,
{
    f(&BACKING.read())
}

/// Number of listeners currently subscribed to the notification channel.
pub fn listener_count() -> usize {
    LISTENERS.read().len()
}

/// Whether this engine's forwarding listener is subscribed.
pub fn is_subscribed() -> bool {
    BRIDGE_LISTENER.lock().is_some()
}

/// Announce a store event to every listener.
///
/// Listeners are snapshotted before invocation: a listener that triggers
/// further store traffic (effects re-reading keys) must not deadlock on the
/// channel lock. A panicking listener aborts the remaining notifications.
fn notify(key: &str, value: Option<&Value>, is_getter: bool) {
    let listeners: Vec<Listener> = LISTENERS
        .read()
        .iter()
        .map(|(_, listener)| Arc::clone(listener))
        .collect();
    for listener in listeners {
        listener(key, value, is_getter);
    }
}

/// Subscribe the engine's forwarding listener, once.
fn ensure_subscribed() {
    let mut bridge = BRIDGE_LISTENER.lock();
    if bridge.is_some() {
        cov_mark::hit!(bridge_already_subscribed);
        return;
    }
    log::debug!("subscribing store bridge listener");
    let key = LISTENERS.write().insert(Arc::new(forward));
    *bridge = Some(key);
}

/// The forwarding listener: map a store announcement onto the key's shadow
/// cell.
fn forward(key: &str, _value: Option<&Value>, is_getter: bool) {
    let cell_id = {
        let mut shadows = SHADOW_CELLS.lock();
        match shadows.get(key) {
            Some(&cell_id) => cell_id,
            None => {
                let cell_id = cell_arena_insert();
                shadows.insert(key.to_owned(), cell_id);
                cell_id
            }
        }
        // Lock released before tracking/dispatch: re-run effects may hit
        // the store (and thus this listener) again.
    };

    if is_getter {
        cell_id.track_dependency();
    } else {
        notify_subscribers(cell_id);
    }
}

/// Detach the engine from the store: unsubscribe the forwarding listener
/// and drop every shadow cell. The backing map is untouched.
pub(crate) fn reset_bridge() {
    if let Some(key) = BRIDGE_LISTENER.lock().take() {
        let mut listeners = LISTENERS.write();
        if listeners.contains(key) {
            listeners.remove(key);
        }
    }

    let shadows: Vec<CellId> = {
        let mut map = SHADOW_CELLS.lock();
        map.drain().map(|(_, cell_id)| cell_id).collect()
    };
    for cell_id in shadows {
        cell_arena_remove(cell_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn map_operations_round_trip() {
        let _serial = crate::tests::engine_lock();
        crate::reset();
        clear();

        assert_eq!(get("missing"), None);

        set("answer", json!(42));
        set("name", json!("finegrain"));
        assert_eq!(get("answer"), Some(json!(42)));

        with_map(|map| {
            assert_eq!(map.len(), 2);
            assert_eq!(map.get("name"), Some(&json!("finegrain")));
        });

        assert!(delete("answer"));
        assert!(!delete("answer"));
        assert_eq!(get("answer"), None);

        clear();
        with_map(|map| assert!(map.is_empty()));
        crate::reset();
    }

    #[test]
    fn subscription_is_lazy_and_idempotent() {
        let _serial = crate::tests::engine_lock();
        crate::reset();
        clear();

        assert!(!is_subscribed());
        set("k", json!(1));
        // Writes alone never subscribe the bridge.
        assert!(!is_subscribed());

        get("k");
        assert!(is_subscribed());
        assert_eq!(listener_count(), 1);

        {
            cov_mark::check!(bridge_already_subscribed);
            get("k");
        }
        assert_eq!(listener_count(), 1);

        crate::reset();
        assert!(!is_subscribed());
        assert_eq!(listener_count(), 0);
        clear();
    }
}
