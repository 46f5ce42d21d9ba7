#![deny(missing_docs)]

//! Fine-grained reactive dependency tracking.
//!
//! State lives in [`State`] cells; units of work run as [`effect`]s. While
//! an effect's body executes, every cell it reads implicitly subscribes it,
//! and any later write to one of those cells synchronously tears the effect
//! down and runs it again - no explicit dependency declarations, no
//! scheduler, no flush step. [`Derived`] cells chain computations, and the
//! [`store`] module bridges a process-wide key/value store into the same
//! graph.
//!
//! # Quick start
//!
//! ```ignore
//! use finegrain::{derived, effect, state};
//!
//! let count = state(1);
//! let doubled = {
//!     let count = count.clone();
//!     derived(move || count.get() * 2)
//! };
//!
//! effect({
//!     let doubled = doubled.clone();
//!     move |_| println!("doubled = {}", doubled.get())
//! }); // prints "doubled = 2" immediately
//!
//! count.set(3); // recomputes and prints "doubled = 6" before returning
//! ```
//!
//! # Tracking model
//!
//! Tracking is ambient: a running effect pushes its handle onto a
//! thread-local active-effect stack, and cell reads consult the top frame.
//! Only the synchronous body of an effect is tracked - anything deferred
//! past it (spawned threads, queued tasks) runs with no active frame. A
//! write dispatches to subscribers in the order they first read the cell,
//! depth-first: nested writes from inside a notified effect cascade fully
//! before the outer dispatch continues. An effect that writes a cell it
//! also reads re-runs at most once extra per outer write; deeper
//! self-triggering is dropped rather than looping.
//!
//! # Ownership and teardown
//!
//! Effect bodies receive an [`EffectScope`] for tying resources to the
//! effect's lifetime: [`EffectScope::on_cleanup`] registers teardown that
//! runs before the next re-run, and [`EffectScope::sub_effect`] spawns a
//! nested effect disposed together with its parent (deepest cleanups
//! first). [`reset`] disposes everything and detaches the store bridge.
//!
//! Panics in effect bodies, cleanups, and store listeners propagate to the
//! caller that triggered the write; teardown is deliberately not
//! best-effort (a panicking cleanup aborts the remaining disposal steps).

pub(crate) mod arena;
mod cell;
mod derived;
mod effect;
pub(crate) mod hash;
mod reset;
pub mod store;

pub use cell::{state, State};
pub use derived::{derived, Derived};
pub use effect::{effect, on_cleanup, untracked, EffectScope};
pub use reset::reset;
