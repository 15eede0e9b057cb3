//! Tick reconciler: ties the board, run registry, spawner, classifier, and
//! policy engine together into a single deterministic control loop (spec
//! §4.H). See [`reconciler::Reconciler`] for the entry point.

/// Per-tick thrash/cooldown/budget guards applied after the policy engine
/// decides but before any action reaches the board.
pub mod guards;
/// Tick orchestration.
pub mod reconciler;
/// Atomic persistence of the state document.
pub mod state_store;

pub use reconciler::{Reconciler, TickOutcome};
pub use state_store::StateStore;
