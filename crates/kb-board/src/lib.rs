//! JSON-RPC client for the external Kanban board (spec §4.C, Board Port).

pub mod client;
/// Board-specific error, converted into [`kb_core::KbError`] at the boundary.
pub mod error;
pub mod protocol;

pub use client::{BoardPort, JsonRpcBoard};
pub use error::{BoardError, BoardResult};
