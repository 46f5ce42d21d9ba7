// Arena-based storage for reactive bookkeeping
//
// Two arenas back the engine:
// - Cell arena: per-cell subscriber sets (values live with the cell owners)
// - Effect arena: per-effect body, sources, cleanups, and ownership links
//
// Both hand out generation-stamped `Copy` handles instead of references, so
// subscriber sets and source sets hold plain ids and disposal is an explicit
// handle-removal operation - no reference cycles, no reliance on drop order.

pub mod cell_arena;
pub mod effect_arena;

pub use cell_arena::{cell_arena_insert, cell_arena_remove, clear_all_subscribers, CellId};
pub use effect_arena::{
    current_effect, effect_arena_clear, effect_arena_insert, effect_arena_remove,
    effect_arena_roots, set_effect_parent, CurrentEffectGuard, EffectCallback, EffectId,
};
