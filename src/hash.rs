//! Hashing support for the engine's internal collections.
//!
//! All subscriber/source sets and lookup tables key on small `Copy` handles
//! (`CellId`, `EffectId`) or short strings, so HashDoS resistance buys
//! nothing here. `FastHashBuilder` is a zero-sized `BuildHasher` over
//! foldhash with a fixed seed: no per-collection state, deterministic
//! hashes, and usable with `with_hasher` in `const` contexts.

use std::hash::BuildHasher;

use foldhash::fast::{FixedState, FoldHasher};

/// Zero-sized, fixed-seed `BuildHasher` used by every internal collection.
#[derive(Clone, Copy, Debug, Default)]
pub struct FastHashBuilder;

impl BuildHasher for FastHashBuilder {
    type Hasher = FoldHasher<'static>;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        FixedState::with_seed(0x2545f4914f6cdd1d).build_hasher()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_is_zero_sized() {
        assert_eq!(std::mem::size_of::<FastHashBuilder>(), 0);
    }

    #[test]
    fn identical_input_hashes_identically() {
        let a = FastHashBuilder.hash_one("store:key");
        let b = FastHashBuilder.hash_one("store:key");
        assert_eq!(a, b);
        assert_ne!(a, FastHashBuilder.hash_one("store:other"));
    }
}
