//! Child-process spawner (spec §4.E).

/// `SpawnError`, converted into [`kb_core::KbError`] at the boundary.
pub mod error;
pub mod spawner;

pub use error::{SpawnError, SpawnResult};
pub use spawner::{render_command, SpawnSpec, Spawner};
