//! Pure classification of board tasks into derived attributes (spec §4.F).

pub mod classify;

pub use classify::classify;
