//! Pure decision engine turning a classified board snapshot, the persisted
//! state, and run-registry signals into an ordered list of board mutations.

pub mod engine;
pub mod signals;

pub use engine::{policy, PolicyContext};
pub use signals::{DocsDoneStatus, DocsSignal, DoneStatus, ReviewSignal, Signals, WipSignal};
