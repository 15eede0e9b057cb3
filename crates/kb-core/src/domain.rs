//! Shared domain model: tasks, columns, runs, the state document, and the
//! `Action` vocabulary the policy engine emits.
//!
//! Grounded on `agentor-orchestrator/src/types.rs` (`Task`, builder-style
//! `with_*` methods, unit tests colocated in the same file).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Stable integer task id from the external board.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque, globally-unique run identifier: UTC timestamp + random suffix.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Board column a task can occupy (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Column {
    Backlog,
    Ready,
    Wip,
    Review,
    Documentation,
    Blocked,
    Done,
}

impl Column {
    /// Exact board column title this column maps to (spec §6).
    pub fn board_title(self) -> &'static str {
        match self {
            Column::Backlog => "Backlog",
            Column::Ready => "Ready",
            Column::Wip => "Work in progress",
            Column::Review => "Review",
            Column::Documentation => "Documentation",
            Column::Blocked => "Blocked",
            Column::Done => "Done",
        }
    }

    /// Parse a board column title back into a [`Column`].
    pub fn from_board_title(title: &str) -> Option<Column> {
        match title {
            "Backlog" => Some(Column::Backlog),
            "Ready" => Some(Column::Ready),
            "Work in progress" => Some(Column::Wip),
            "Review" => Some(Column::Review),
            "Documentation" => Some(Column::Documentation),
            "Blocked" => Some(Column::Blocked),
            "Done" => Some(Column::Done),
            _ => None,
        }
    }
}

/// A task as read from the board, opaque beyond these fields (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub column: Column,
    /// Lower = higher priority within a column.
    pub position: i64,
    pub title: String,
    pub description: String,
    pub tags: BTreeSet<String>,
}

impl Task {
    /// True iff `tag` is present.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// True iff any tag starts with `prefix` (e.g. `"paused:"`).
    pub fn has_tag_prefixed(&self, prefix: &str) -> bool {
        self.tags.iter().any(|t| t.starts_with(prefix))
    }
}

/// Kind of child run (spec §3 Run entity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Worker,
    Reviewer,
    Docs,
}

impl std::fmt::Display for RunKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunKind::Worker => "worker",
            RunKind::Reviewer => "reviewer",
            RunKind::Docs => "docs",
        };
        write!(f, "{s}")
    }
}

/// State record pointing at the current worker run for a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerEntry {
    pub run_id: RunId,
    pub run_dir: PathBuf,
    pub done_path: PathBuf,
    pub patch_path: PathBuf,
    pub comment_path: PathBuf,
    pub started_at_ms: i64,
    pub exec_session_id: Option<String>,
    pub repo_key: Option<String>,
    pub repo_path: Option<PathBuf>,
}

/// State record pointing at the current reviewer run for a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewerEntry {
    pub run_id: RunId,
    pub run_dir: PathBuf,
    pub result_path: PathBuf,
    pub started_at_ms: i64,
    pub exec_session_id: Option<String>,
    /// Revision of the patch this reviewer was spawned against; used by the
    /// recovery-eligibility rule (spec §4.D).
    pub patch_revision: String,
}

/// State record pointing at the current docs run for a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocsEntry {
    pub run_id: RunId,
    pub run_dir: PathBuf,
    pub done_path: PathBuf,
    pub patch_path: PathBuf,
    pub comment_path: PathBuf,
    pub started_at_ms: i64,
    pub exec_session_id: Option<String>,
}

/// Any of the three entry kinds, used by [`Action::RecordEntry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEntry {
    Worker(WorkerEntry),
    Reviewer(ReviewerEntry),
    Docs(DocsEntry),
}

/// Normalized review verdict (spec §4.D).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Rework,
    Blocker,
}

/// A stored, normalized review result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewResult {
    pub score: i64,
    pub verdict: Verdict,
    pub critical_items: Vec<String>,
    pub notes: String,
    pub review_revision: Option<String>,
    pub stored_at_ms: i64,
}

/// One rework event recorded for the thrash guard (spec §4.I).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReworkEvent {
    pub revision: String,
    pub ms: i64,
}

/// Bookkeeping for `paused:critical`, so it can be removed only when this
/// orchestrator added it (spec §4.G.1).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PausedByCritical {
    pub why_tags_added: Vec<String>,
}

fn default_schema_version() -> u32 {
    1
}

/// The single JSON state document (spec §3). Field-additive across schema
/// versions; keys this build doesn't recognize land in `extra` via
/// `#[serde(flatten)]` and are re-emitted verbatim on save instead of being
/// dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub dry_run_runs_remaining: u32,
    #[serde(default)]
    pub last_actions_by_task_id: BTreeMap<TaskId, i64>,
    #[serde(default)]
    pub swimlane_priority: Vec<String>,
    #[serde(default)]
    pub repo_map: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub repo_by_task_id: BTreeMap<TaskId, String>,
    #[serde(default)]
    pub workers_by_task_id: BTreeMap<TaskId, WorkerEntry>,
    #[serde(default)]
    pub reviewers_by_task_id: BTreeMap<TaskId, ReviewerEntry>,
    #[serde(default)]
    pub docs_by_task_id: BTreeMap<TaskId, DocsEntry>,
    #[serde(default)]
    pub review_results_by_task_id: BTreeMap<TaskId, ReviewResult>,
    #[serde(default)]
    pub paused_by_critical: BTreeMap<TaskId, PausedByCritical>,
    #[serde(default)]
    pub auto_blocked_by_orchestrator: BTreeMap<TaskId, String>,
    #[serde(default)]
    pub respawn_history_by_task_id: BTreeMap<TaskId, Vec<i64>>,
    #[serde(default)]
    pub review_rework_history_by_task_id: BTreeMap<TaskId, Vec<ReworkEvent>>,

    /// Fields a newer schema version wrote that this build doesn't know
    /// about yet. Preserved rather than discarded on load/save.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            dry_run: false,
            dry_run_runs_remaining: 0,
            last_actions_by_task_id: BTreeMap::new(),
            swimlane_priority: Vec::new(),
            repo_map: BTreeMap::new(),
            repo_by_task_id: BTreeMap::new(),
            workers_by_task_id: BTreeMap::new(),
            reviewers_by_task_id: BTreeMap::new(),
            docs_by_task_id: BTreeMap::new(),
            review_results_by_task_id: BTreeMap::new(),
            paused_by_critical: BTreeMap::new(),
            auto_blocked_by_orchestrator: BTreeMap::new(),
            respawn_history_by_task_id: BTreeMap::new(),
            review_rework_history_by_task_id: BTreeMap::new(),
            extra: serde_json::Map::new(),
        }
    }
}

impl State {
    /// True iff `run_id` already appears in any of the three entry maps
    /// (invariant §3.4).
    pub fn run_id_in_use(&self, run_id: &RunId) -> bool {
        self.workers_by_task_id.values().any(|e| &e.run_id == run_id)
            || self
                .reviewers_by_task_id
                .values()
                .any(|e| &e.run_id == run_id)
            || self.docs_by_task_id.values().any(|e| &e.run_id == run_id)
    }
}

/// Where a task's repository resolved to (spec §4.F).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepoResolution {
    /// Resolved via `repoMap` or an absolute path.
    Mapped { key: String, path: PathBuf },
    /// Tagged `no-repo`; exempt from repo gating.
    NoRepo,
    /// A repo key/hint was found but does not resolve in `repoMap`.
    Unmapped { hint: String },
    /// No repo directive was found at all.
    Absent,
}

/// Reason a task sits in `Blocked` (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockedReason {
    Deps,
    Exclusive,
    Repo,
    Thrash,
    Artifact,
}

impl BlockedReason {
    pub fn tag(self) -> &'static str {
        match self {
            BlockedReason::Deps => "blocked:deps",
            BlockedReason::Exclusive => "blocked:exclusive",
            BlockedReason::Repo => "blocked:repo",
            BlockedReason::Thrash => "blocked:thrash",
            BlockedReason::Artifact => "blocked:artifact",
        }
    }
}

/// Reason a task carries a `paused`/`paused:*` tag (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PauseReason {
    Critical,
    MissingWorker,
    Thrash,
    StaleWorker,
}

impl PauseReason {
    pub fn tag(self) -> &'static str {
        match self {
            PauseReason::Critical => "paused:critical",
            PauseReason::MissingWorker => "paused:missing-worker",
            PauseReason::Thrash => "paused:thrash",
            PauseReason::StaleWorker => "paused:stale-worker",
        }
    }
}

/// Review-phase tag a task in Review may carry (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReviewPhase {
    Auto,
    Pending,
    Inflight,
    Pass,
    Rework,
    Error,
    BlockedWip,
    Rerun,
    Retry,
}

/// Docs-phase tag a task in Documentation may carry (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DocsPhase {
    Auto,
    Pending,
    Inflight,
    Completed,
    Skip,
    Error,
    Retry,
}

/// Derived, not-stored-on-the-board attributes for one task (spec §3/§4.F).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivedTask {
    pub task: Task,
    pub repo: RepoResolution,
    pub dependencies: BTreeSet<TaskId>,
    pub exclusivity_key: Option<String>,
    pub is_critical: bool,
    pub is_held: bool,
    pub is_epic: bool,
    pub review_phases: BTreeSet<ReviewPhase>,
    pub docs_phases: BTreeSet<DocsPhase>,
    pub paused: bool,
    pub pause_reasons: BTreeSet<PauseReason>,
    pub blocked_reason: Option<BlockedReason>,
    /// True iff the task carries `hold:queued-critical` — a hold the
    /// orchestrator itself manages, unfenced automatically while this task
    /// is the active critical (spec §4.F/§4.G.1).
    pub hold_queued_critical: bool,
}

impl DerivedTask {
    pub fn id(&self) -> TaskId {
        self.task.id
    }

    pub fn column(&self) -> Column {
        self.task.column
    }

    pub fn has_review_phase(&self, phase: ReviewPhase) -> bool {
        self.review_phases.contains(&phase)
    }

    pub fn has_docs_phase(&self, phase: DocsPhase) -> bool {
        self.docs_phases.contains(&phase)
    }
}

/// Board mutation or internal bookkeeping update the policy engine may
/// emit (spec §4.G). `Action`s are the only things that mutate the world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Action {
    MoveTask {
        id: TaskId,
        to: Column,
    },
    AddTag {
        id: TaskId,
        tag: String,
    },
    RemoveTag {
        id: TaskId,
        tag: String,
    },
    PostComment {
        id: TaskId,
        text: String,
    },
    CreateTask {
        column: Column,
        title: String,
        description: String,
        tags: BTreeSet<String>,
    },
    SpawnRun {
        kind: RunKind,
        id: TaskId,
    },
    RecordEntry {
        id: TaskId,
        entry: RunEntry,
    },
    ClearEntry {
        kind: RunKind,
        id: TaskId,
    },
    NotifyBlocker {
        id: TaskId,
        message: String,
    },
    Persist(StateDelta),
}

impl Action {
    /// The task this action concerns, if any (used for cooldown bookkeeping
    /// and ascending-task-id tie-breaking, spec §4.G).
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Action::MoveTask { id, .. }
            | Action::AddTag { id, .. }
            | Action::RemoveTag { id, .. }
            | Action::PostComment { id, .. }
            | Action::SpawnRun { id, .. }
            | Action::RecordEntry { id, .. }
            | Action::ClearEntry { id, .. }
            | Action::NotifyBlocker { id, .. } => Some(*id),
            Action::CreateTask { .. } => None,
            Action::Persist(delta) => delta.task_id(),
        }
    }

    /// True iff this action counts as a board mutation against the
    /// per-tick `actionBudget` (spec §4.H): `Persist` is internal
    /// bookkeeping and does not count.
    pub fn counts_against_budget(&self) -> bool {
        !matches!(self, Action::Persist(_))
    }
}

/// Internal state-bookkeeping update, applied by the reconciler without a
/// corresponding board call (spec §4.G `Persist(stateDelta)`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StateDelta {
    AppendRespawn { task: TaskId, at_ms: i64 },
    AppendReworkHistory { task: TaskId, event: ReworkEvent },
    SetLastAction { task: TaskId, at_ms: i64 },
    SetPausedByCritical { task: TaskId, why_tags_added: Vec<String> },
    ClearPausedByCritical { task: TaskId },
    SetAutoBlocked { task: TaskId, reason: String },
    ClearAutoBlocked { task: TaskId },
    SetReviewResult { task: TaskId, result: ReviewResult },
    SetRepoForTask { task: TaskId, repo_key: String },
}

impl StateDelta {
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            StateDelta::AppendRespawn { task, .. }
            | StateDelta::AppendReworkHistory { task, .. }
            | StateDelta::SetLastAction { task, .. }
            | StateDelta::SetPausedByCritical { task, .. }
            | StateDelta::ClearPausedByCritical { task }
            | StateDelta::SetAutoBlocked { task, .. }
            | StateDelta::ClearAutoBlocked { task }
            | StateDelta::SetReviewResult { task, .. }
            | StateDelta::SetRepoForTask { task, .. } => Some(*task),
        }
    }
}

/// Current wall-clock milliseconds, as stored on state records. Callers
/// pass this in from [`crate::clock::Clock`] rather than reading time
/// directly, keeping the domain model pure.
pub fn now_ms(now: DateTime<Utc>) -> i64 {
    now.timestamp_millis()
}
