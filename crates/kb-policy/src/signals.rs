//! Per-task observations the reconciler gathers from the run registry
//! before calling into [`crate::engine::policy`]. Kept separate from
//! [`kb_core::domain::DerivedTask`] because these come from disk reads,
//! not from the board or tag parsing — threading them in as plain data
//! keeps the engine itself synchronous and pure.

use std::collections::BTreeMap;

use kb_core::domain::{ReviewResult, TaskId};

/// Whether the current worker/docs `done.json` validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneStatus {
    Valid,
    Invalid,
}

#[derive(Debug, Clone, Default)]
pub struct WipSignal {
    /// `None` until `done.json` appears under the recorded path.
    pub done: Option<DoneStatus>,
    /// Worker log hasn't been touched in longer than the staleness
    /// threshold, while a handle is still recorded.
    pub stale: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ReviewSignal {
    /// Normalized result once the reviewer's `review.json` validates,
    /// including results recovered from an eligible stray file.
    pub result: Option<ReviewResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocsDoneStatus {
    Completed,
    Skipped,
    Invalid,
}

#[derive(Debug, Clone, Default)]
pub struct DocsSignal {
    pub done: Option<DocsDoneStatus>,
}

/// All registry-derived observations for one tick, keyed by task id.
#[derive(Debug, Clone, Default)]
pub struct Signals {
    pub wip: BTreeMap<TaskId, WipSignal>,
    pub review: BTreeMap<TaskId, ReviewSignal>,
    pub docs: BTreeMap<TaskId, DocsSignal>,
    /// Current patch revision backing a task in Review, used by the rework
    /// thrash guard to recognize repeat failures of the *same* patch.
    pub current_patch_revision: BTreeMap<TaskId, String>,
}

impl Signals {
    pub fn wip_signal(&self, id: TaskId) -> WipSignal {
        self.wip.get(&id).cloned().unwrap_or_default()
    }

    pub fn review_signal(&self, id: TaskId) -> ReviewSignal {
        self.review.get(&id).cloned().unwrap_or_default()
    }

    pub fn docs_signal(&self, id: TaskId) -> DocsSignal {
        self.docs.get(&id).cloned().unwrap_or_default()
    }
}
