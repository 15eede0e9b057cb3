//! Best-effort operator notification (spec §4.K): a single call per tick
//! summarizing what happened, routed through a configurable external
//! command. Implementations must never fail the tick.

pub mod notify;

pub use notify::{CommandNotifier, NullNotifier, Notifier, TickSummary};
