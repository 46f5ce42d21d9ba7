use crate::cell::State;
use crate::effect::effect;

/// A read-only cell whose value is always the output of a pure computation
/// over other cells.
///
/// Internally this is a plain [`State`] written by a private effect: the
/// computation runs once at construction (so the value is present before
/// `derived` returns) and again whenever any cell it read changes. Reading a
/// `Derived` tracks like any other cell read, so effects and further derived
/// cells can chain off it; a single upstream write propagates through the
/// whole chain synchronously, in dependency order, before the triggering
/// `set` returns.
///
/// There is no memoization: every upstream write recomputes and re-notifies,
/// mirroring the no-equality-short-circuit contract of [`State::set`].
pub struct Derived<T> {
    state: State<Option<T>>,
}

impl<T: Clone> Derived<T> {
    /// Read a clone of the current derived value, registering the active
    /// effect (if any) as a subscriber.
    pub fn get(&self) -> T {
        self.state
            .get()
            .expect("derived value is computed during construction")
    }
}

impl<T> Derived<T> {
    /// Read the derived value through a borrow. See [`State::with`].
    pub fn with<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&T) -> R,
    {
        self.state.with(|value| {
            f(value
                .as_ref()
                .expect("derived value is computed during construction"))
        })
    }

    #[cfg(test)]
    pub(crate) fn cell_id(&self) -> crate::arena::CellId {
        self.state.cell_id()
    }
}

impl<T> Clone for Derived<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

/// Create a derived cell computed by `f`.
///
/// `f` runs immediately inside an internal effect; every cell it reads
/// becomes a dependency, and any write to one of them recomputes the value
/// and notifies the derived cell's own subscribers in turn.
pub fn derived<T, F>(mut f: F) -> Derived<T>
where
    T: Send + Sync + 'static,
    F: FnMut() -> T + Send + 'static,
{
    let state: State<Option<T>> = State::new(None);

    let output = state.clone();
    effect(move |_| {
        // Compute first: reads inside `f` subscribe this effect, the write
        // below then cascades to whatever depends on the derived cell.
        let value = f();
        output.set(Some(value));
    });

    Derived { state }
}
