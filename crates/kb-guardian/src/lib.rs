//! Out-of-process heartbeat watcher (spec §4.J): reads the reconciler's
//! heartbeat file and restarts it via a configured bring-up command if it
//! goes stale, while guarding against restart loops.

pub mod guardian;

pub use guardian::{Guardian, GuardianOutcome, Heartbeat};
