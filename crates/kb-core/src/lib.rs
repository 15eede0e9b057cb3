//! Shared types for the kanban orchestrator: domain model, error, config,
//! monotonic clock, and the cross-process tick lock.
//!
//! # Main types
//!
//! - [`error::KbError`] — top-level error, composed from per-subsystem crates.
//! - [`domain`] — `Task`, `Column`, ids, the state document schema.
//! - [`config::Config`] — recognized configuration options (spec §6).
//! - [`clock::Clock`] — monotonic time source.
//! - [`lock::TickLock`] — cross-process single-writer advisory lock.

/// Monotonic time source.
pub mod clock;
/// Recognized configuration options.
pub mod config;
/// Shared domain model (tasks, columns, runs, state document, actions).
pub mod domain;
/// Top-level error type.
pub mod error;
/// Tracing-subscriber initialization.
pub mod logging;
/// Cross-process single-writer tick lock.
pub mod lock;

pub use error::{KbError, KbResult};
