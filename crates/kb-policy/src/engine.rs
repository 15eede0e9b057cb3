//! The policy engine: given a classified snapshot, the persisted state, and
//! registry signals, decide the ordered list of board mutations for one
//! tick. Pure and synchronous — no I/O, no waiting, no randomness.
//!
//! Grounded on `agentor-orchestrator/src/engine.rs`'s phased `plan` →
//! `execute` → `synthesize` pipeline, collapsed from an async multi-phase
//! loop into a single pure function with one phase per priority tier, and
//! `agentor-orchestrator/src/task_queue.rs`'s dependency-aware selection
//! (`all_ready`/cycle-safe traversal reused for the promotion phase).

use std::collections::{BTreeMap, BTreeSet};

use kb_core::config::{Config, MissingWorkerPolicy};
use kb_core::domain::{
    Action, BlockedReason, Column, DerivedTask, PauseReason, ReviewPhase, RunKind, StateDelta,
    TaskId, Verdict,
};

use crate::signals::{DocsDoneStatus, DoneStatus, Signals};

/// Everything the engine needs beyond the classified tasks themselves.
pub struct PolicyContext<'a> {
    /// The persisted state document from the previous tick.
    pub state: &'a kb_core::domain::State,
    /// Run-registry observations gathered for this tick.
    pub signals: &'a Signals,
    /// Loaded configuration.
    pub config: &'a Config,
    /// Whether a Documentation column exists to route passed reviews
    /// through. The board port exposes no column-listing call, so this is
    /// derived from configuration (a non-empty `docsColumnTitle`) rather
    /// than queried from the board itself.
    pub docs_column_present: bool,
    /// Wall-clock time of this tick, in epoch milliseconds.
    pub now_ms: i64,
}

/// Decide the full ordered action list for one tick.
///
/// Ordering is stable: critical management, then WIP reconciliation, then
/// review servicing, then docs servicing, then auto-heal, then epic
/// breakdown, then promotion — ties within a tier are broken by ascending
/// task id. Auto-heal running ahead of promotion (rather than after, as its
/// numbering among the decision rules might suggest) means a task that
/// un-blocks this tick is visible to the same tick's promotion pass.
pub fn policy(tasks: &[DerivedTask], ctx: &PolicyContext<'_>) -> Vec<Action> {
    let by_id: BTreeMap<TaskId, DerivedTask> =
        tasks.iter().cloned().map(|t| (t.id(), t)).collect();

    let critical_tasks: Vec<&DerivedTask> = by_id
        .values()
        .filter(|t| t.is_critical && !t.is_held)
        .collect();
    let active_critical = critical_tasks
        .iter()
        .find(|t| t.column() == Column::Wip)
        .map(|t| t.id());
    let critical_in_wip = active_critical.is_some();

    let mut actions = Vec::new();

    let (critical_actions, newly_active_critical) =
        critical_phase(&by_id, ctx, &critical_tasks, active_critical);
    actions.extend(critical_actions);

    let critical_holds_wip = critical_in_wip || newly_active_critical.is_some();

    let mut wip_count = by_id
        .values()
        .filter(|t| t.column() == Column::Wip)
        .count() as u32;
    if newly_active_critical.is_some() {
        wip_count += 1;
    }

    actions.extend(wip_reconciliation_phase(&by_id, ctx));
    actions.extend(review_servicing_phase(&by_id, ctx, ctx.config.wip_limit, &mut wip_count));
    if ctx.docs_column_present {
        actions.extend(docs_servicing_phase(&by_id, ctx));
    }
    actions.extend(auto_heal_phase(&by_id));
    actions.extend(epic_breakdown_phase(&by_id));

    if !critical_holds_wip {
        actions.extend(promotion_phase(&by_id, ctx, &mut wip_count));
    }

    actions
}

/// Decision tier 1: critical management (spec-equivalent of the
/// "critical management" rule — promote, fence, preempt, unfence).
fn critical_phase(
    by_id: &BTreeMap<TaskId, DerivedTask>,
    ctx: &PolicyContext<'_>,
    critical_tasks: &[&DerivedTask],
    active_critical: Option<TaskId>,
) -> (Vec<Action>, Option<TaskId>) {
    let mut actions = Vec::new();

    if critical_tasks.is_empty() {
        actions.extend(clear_critical_pause(by_id, ctx));
        return (actions, None);
    }

    if let Some(active_id) = active_critical {
        let active = &by_id[&active_id];
        if active.hold_queued_critical {
            actions.push(Action::RemoveTag {
                id: active_id,
                tag: "hold:queued-critical".into(),
            });
        }
        for wip_task in by_id.values().filter(|t| t.column() == Column::Wip && t.id() != active_id) {
            if !wip_task.paused || !wip_task.pause_reasons.contains(&PauseReason::Critical) {
                actions.push(Action::AddTag {
                    id: wip_task.id(),
                    tag: "paused".into(),
                });
                actions.push(Action::AddTag {
                    id: wip_task.id(),
                    tag: "paused:critical".into(),
                });
                actions.push(Action::Persist(StateDelta::SetPausedByCritical {
                    task: wip_task.id(),
                    why_tags_added: vec!["paused".into(), "paused:critical".into()],
                }));
            }
        }
        return (actions, Some(active_id));
    }

    // No critical is in WIP yet: promote the best startable critical ahead
    // of everything else.
    let mut candidates: Vec<&DerivedTask> = critical_tasks
        .iter()
        .copied()
        .filter(|t| matches!(t.column(), Column::Backlog | Column::Ready))
        .filter(|t| selection_blockers(by_id, t).is_empty())
        .collect();
    candidates.sort_by_key(|t| (t.task.position, t.id()));

    if let Some(chosen) = candidates.into_iter().next() {
        let id = chosen.id();
        if chosen.column() == Column::Backlog {
            actions.push(Action::MoveTask { id, to: Column::Ready });
        }
        actions.push(Action::MoveTask { id, to: Column::Wip });
        actions.push(Action::SpawnRun { kind: RunKind::Worker, id });
        if chosen.hold_queued_critical {
            actions.push(Action::RemoveTag {
                id,
                tag: "hold:queued-critical".into(),
            });
        }
        return (actions, Some(id));
    }

    // No critical task is startable this tick (none ready, or all blocked).
    // Clearing stale pauses is keyed on "no critical remains in WIP", not on
    // "no critical task exists anywhere" — a critical stuck in Backlog on an
    // unmet dependency must not keep other tasks fenced forever.
    actions.extend(clear_critical_pause(by_id, ctx));
    (actions, None)
}

fn clear_critical_pause(by_id: &BTreeMap<TaskId, DerivedTask>, ctx: &PolicyContext<'_>) -> Vec<Action> {
    let mut actions = Vec::new();
    for (id, paused) in &ctx.state.paused_by_critical {
        let Some(task) = by_id.get(id) else { continue };
        for tag in &paused.why_tags_added {
            if task.task.has_tag(tag) {
                actions.push(Action::RemoveTag {
                    id: *id,
                    tag: tag.clone(),
                });
            }
        }
        actions.push(Action::Persist(StateDelta::ClearPausedByCritical { task: *id }));
    }
    actions
}

/// Decision tier 2: reconcile each WIP task against its worker entry and
/// the observed `done.json` signal.
fn wip_reconciliation_phase(by_id: &BTreeMap<TaskId, DerivedTask>, ctx: &PolicyContext<'_>) -> Vec<Action> {
    let mut wip_tasks: Vec<&DerivedTask> = by_id.values().filter(|t| t.column() == Column::Wip).collect();
    wip_tasks.sort_by_key(|t| t.id());

    let mut actions = Vec::new();
    for task in wip_tasks {
        let id = task.id();
        let has_entry = ctx.state.workers_by_task_id.contains_key(&id);

        if has_entry {
            let signal = ctx.signals.wip_signal(id);
            match signal.done {
                Some(DoneStatus::Valid) => {
                    let entry = &ctx.state.workers_by_task_id[&id];
                    actions.push(Action::PostComment {
                        id,
                        text: format!("see {}", entry.comment_path.display()),
                    });
                    actions.push(Action::AddTag { id, tag: "review:auto".into() });
                    actions.push(Action::AddTag { id, tag: "review:pending".into() });
                    actions.push(Action::MoveTask { id, to: Column::Review });
                    actions.push(Action::ClearEntry { kind: RunKind::Worker, id });
                }
                Some(DoneStatus::Invalid) => {
                    actions.push(Action::MoveTask { id, to: Column::Backlog });
                    actions.push(Action::AddTag { id, tag: BlockedReason::Artifact.tag().into() });
                    actions.push(Action::ClearEntry { kind: RunKind::Worker, id });
                }
                None if signal.stale => {
                    if !task.pause_reasons.contains(&PauseReason::StaleWorker) {
                        actions.push(Action::AddTag { id, tag: "paused".into() });
                        actions.push(Action::AddTag { id, tag: PauseReason::StaleWorker.tag().into() });
                    }
                }
                None => {}
            }
        } else {
            match ctx.config.missing_worker_policy {
                MissingWorkerPolicy::Spawn => {
                    actions.push(Action::SpawnRun { kind: RunKind::Worker, id });
                }
                MissingWorkerPolicy::Pause => {
                    actions.push(Action::AddTag { id, tag: "paused".into() });
                    actions.push(Action::AddTag {
                        id,
                        tag: PauseReason::MissingWorker.tag().into(),
                    });
                    actions.push(Action::MoveTask { id, to: Column::Blocked });
                }
            }
        }
    }
    actions
}

/// Decision tier 3: service reviewers (spawn, consume PASS/REWORK/BLOCKER,
/// apply the rework thrash guard).
fn review_servicing_phase(
    by_id: &BTreeMap<TaskId, DerivedTask>,
    ctx: &PolicyContext<'_>,
    wip_limit: u32,
    wip_count: &mut u32,
) -> Vec<Action> {
    let mut review_tasks: Vec<&DerivedTask> =
        by_id.values().filter(|t| t.column() == Column::Review).collect();
    review_tasks.sort_by_key(|t| t.id());

    let mut actions = Vec::new();
    for task in review_tasks {
        let id = task.id();
        let has_entry = ctx.state.reviewers_by_task_id.contains_key(&id);

        if !has_entry {
            // review:rerun and review:retry are treated interchangeably: either
            // one reopens a task parked in review:error.
            let fresh_request = task.has_review_phase(ReviewPhase::Pending)
                && task.has_review_phase(ReviewPhase::Auto);
            let reopened = task.has_review_phase(ReviewPhase::Rerun)
                || task.has_review_phase(ReviewPhase::Retry);
            if fresh_request || reopened {
                actions.push(Action::SpawnRun { kind: RunKind::Reviewer, id });
                actions.push(Action::AddTag { id, tag: "review:inflight".into() });
                for tag in ["review:pending", "review:error", "review:rerun", "review:retry"] {
                    actions.push(Action::RemoveTag { id, tag: tag.into() });
                }
            }
            continue;
        }

        let signal = ctx.signals.review_signal(id);
        let Some(result) = signal.result else { continue };

        match result.verdict {
            Verdict::Pass => {
                actions.push(Action::AddTag { id, tag: "review:pass".into() });
                for tag in [
                    "review:pending",
                    "review:inflight",
                    "review:rework",
                    "needs-rework",
                    "review:blocked:wip",
                    "review:error",
                ] {
                    actions.push(Action::RemoveTag { id, tag: tag.into() });
                }
                actions.push(Action::ClearEntry { kind: RunKind::Reviewer, id });
                if ctx.config.review_auto_done {
                    actions.push(Action::MoveTask { id, to: Column::Done });
                } else if ctx.docs_column_present {
                    actions.push(Action::MoveTask { id, to: Column::Documentation });
                    actions.push(Action::AddTag { id, tag: "docs:auto".into() });
                    actions.push(Action::AddTag { id, tag: "docs:pending".into() });
                }
            }
            Verdict::Rework | Verdict::Blocker => {
                let revision = ctx.signals.current_patch_revision.get(&id).cloned();
                if let Some(revision) = &revision {
                    if rework_thrash_exceeded(ctx, id, revision) {
                        actions.push(Action::MoveTask { id, to: Column::Backlog });
                        actions.push(Action::AddTag { id, tag: BlockedReason::Thrash.tag().into() });
                        actions.push(Action::ClearEntry { kind: RunKind::Reviewer, id });
                        continue;
                    }
                }

                actions.push(Action::AddTag { id, tag: "review:rework".into() });
                actions.push(Action::AddTag { id, tag: "needs-rework".into() });
                actions.push(Action::ClearEntry { kind: RunKind::Reviewer, id });
                if let Some(revision) = revision {
                    actions.push(Action::Persist(StateDelta::AppendReworkHistory {
                        task: id,
                        event: kb_core::domain::ReworkEvent {
                            revision,
                            ms: ctx.now_ms,
                        },
                    }));
                }

                if *wip_count < wip_limit {
                    actions.push(Action::MoveTask { id, to: Column::Wip });
                    actions.push(Action::SpawnRun { kind: RunKind::Worker, id });
                    *wip_count += 1;
                } else {
                    actions.push(Action::AddTag { id, tag: "review:blocked:wip".into() });
                }
            }
        }
    }
    actions
}

fn rework_thrash_exceeded(ctx: &PolicyContext<'_>, id: TaskId, revision: &str) -> bool {
    let Some(history) = ctx.state.review_rework_history_by_task_id.get(&id) else {
        return false;
    };
    let window_start = ctx.now_ms - ctx.config.thrash_window_min * 60_000;
    let count = history
        .iter()
        .filter(|e| e.revision == revision && e.ms >= window_start)
        .count() as u32;
    count > ctx.config.max_reworks_per_revision
}

/// Decision tier 4: service docs runs, only called when a Documentation
/// column exists.
fn docs_servicing_phase(by_id: &BTreeMap<TaskId, DerivedTask>, ctx: &PolicyContext<'_>) -> Vec<Action> {
    let mut docs_tasks: Vec<&DerivedTask> =
        by_id.values().filter(|t| t.column() == Column::Documentation).collect();
    docs_tasks.sort_by_key(|t| t.id());

    let mut actions = Vec::new();
    for task in docs_tasks {
        let id = task.id();
        let has_entry = ctx.state.docs_by_task_id.contains_key(&id);

        if !has_entry {
            let fresh_request = task.has_docs_phase(kb_core::domain::DocsPhase::Auto)
                && task.has_docs_phase(kb_core::domain::DocsPhase::Pending);
            let reopened = task.has_docs_phase(kb_core::domain::DocsPhase::Retry);
            if fresh_request || reopened {
                actions.push(Action::SpawnRun { kind: RunKind::Docs, id });
                actions.push(Action::AddTag { id, tag: "docs:inflight".into() });
                for tag in ["docs:pending", "docs:error", "docs:retry"] {
                    actions.push(Action::RemoveTag { id, tag: tag.into() });
                }
            }
            continue;
        }

        let signal = ctx.signals.docs_signal(id);
        match signal.done {
            Some(DocsDoneStatus::Completed) => {
                let entry = &ctx.state.docs_by_task_id[&id];
                actions.push(Action::AddTag { id, tag: "docs:completed".into() });
                actions.push(Action::PostComment {
                    id,
                    text: format!("see {}", entry.comment_path.display()),
                });
                actions.push(Action::MoveTask { id, to: Column::Done });
                actions.push(Action::ClearEntry { kind: RunKind::Docs, id });
            }
            Some(DocsDoneStatus::Skipped) => {
                let entry = &ctx.state.docs_by_task_id[&id];
                actions.push(Action::AddTag { id, tag: "docs:skip".into() });
                actions.push(Action::PostComment {
                    id,
                    text: format!("see {}", entry.comment_path.display()),
                });
                actions.push(Action::MoveTask { id, to: Column::Done });
                actions.push(Action::ClearEntry { kind: RunKind::Docs, id });
            }
            Some(DocsDoneStatus::Invalid) => {
                actions.push(Action::AddTag { id, tag: "docs:error".into() });
                actions.push(Action::ClearEntry { kind: RunKind::Docs, id });
            }
            None => {}
        }
    }
    actions
}

/// Decision tier 5 (in emission order; numbered 7 among the decision
/// rules): a Blocked task whose reason has cleared moves back to Ready.
fn auto_heal_phase(by_id: &BTreeMap<TaskId, DerivedTask>) -> Vec<Action> {
    let mut blocked: Vec<&DerivedTask> = by_id.values().filter(|t| t.column() == Column::Blocked).collect();
    blocked.sort_by_key(|t| t.id());

    let mut actions = Vec::new();
    for task in blocked {
        let Some(reason) = task.blocked_reason else { continue };
        let cleared = match reason {
            BlockedReason::Deps => selection_blockers(by_id, task)
                .iter()
                .all(|b| !matches!(b, Blocker::Deps)),
            BlockedReason::Exclusive => selection_blockers(by_id, task)
                .iter()
                .all(|b| !matches!(b, Blocker::Exclusive)),
            BlockedReason::Repo => selection_blockers(by_id, task)
                .iter()
                .all(|b| !matches!(b, Blocker::Repo)),
            BlockedReason::Thrash | BlockedReason::Artifact => false,
        };
        if cleared {
            let id = task.id();
            actions.push(Action::RemoveTag { id, tag: reason.tag().into() });
            actions.push(Action::RemoveTag { id, tag: "auto-blocked".into() });
            actions.push(Action::MoveTask { id, to: Column::Ready });
            actions.push(Action::Persist(StateDelta::ClearAutoBlocked { task: id }));
        }
    }
    actions
}

/// Decision tier 6: ensure a breakdown stub exists for the top epic.
fn epic_breakdown_phase(by_id: &BTreeMap<TaskId, DerivedTask>) -> Vec<Action> {
    let mut backlog: Vec<&DerivedTask> = by_id.values().filter(|t| t.column() == Column::Backlog).collect();
    backlog.sort_by_key(|t| t.task.position);

    let Some(top) = backlog.first() else { return Vec::new() };
    if !top.is_epic {
        return Vec::new();
    }

    let expected_title = format!("Break down epic #{}: {}", top.id(), top.task.title);
    let already_exists = by_id.values().any(|t| {
        matches!(t.column(), Column::Backlog | Column::Ready | Column::Wip | Column::Review)
            && t.task.title == expected_title
    });
    if already_exists {
        return Vec::new();
    }

    vec![Action::CreateTask {
        column: Column::Backlog,
        title: expected_title,
        description: String::new(),
        tags: BTreeSet::new(),
    }]
}

/// Decision tier 7 (emitted last): promote Backlog → Ready → WIP.
fn promotion_phase(
    by_id: &BTreeMap<TaskId, DerivedTask>,
    ctx: &PolicyContext<'_>,
    wip_count: &mut u32,
) -> Vec<Action> {
    let mut actions = Vec::new();
    if *wip_count >= ctx.config.wip_limit {
        return actions;
    }

    let mut candidates: Vec<&DerivedTask> = by_id
        .values()
        .filter(|t| matches!(t.column(), Column::Backlog | Column::Ready))
        .filter(|t| !t.is_critical)
        .filter(|t| !t.is_epic)
        .filter(|t| !t.is_held)
        .filter(|t| !t.paused)
        .collect();
    candidates.sort_by_key(|t| (t.task.position, t.id()));

    for task in candidates {
        if *wip_count >= ctx.config.wip_limit {
            break;
        }
        let id = task.id();
        let blockers = selection_blockers(by_id, task);
        if !blockers.is_empty() {
            let reason_tag = blockers[0].tag();
            if task.column() == Column::Backlog && !task.task.has_tag(reason_tag) {
                actions.push(Action::AddTag { id, tag: reason_tag.to_string() });
            }
            continue;
        }

        if task.column() == Column::Backlog {
            actions.push(Action::MoveTask { id, to: Column::Ready });
        }
        actions.push(Action::MoveTask { id, to: Column::Wip });
        actions.push(Action::SpawnRun { kind: RunKind::Worker, id });
        *wip_count += 1;
    }

    actions
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Blocker {
    Deps,
    Exclusive,
    Repo,
}

impl Blocker {
    fn tag(self) -> &'static str {
        match self {
            Blocker::Deps => BlockedReason::Deps.tag(),
            Blocker::Exclusive => BlockedReason::Exclusive.tag(),
            Blocker::Repo => BlockedReason::Repo.tag(),
        }
    }
}

/// Deterministic blocks on promotion/auto-heal: unmet dependencies, a
/// contended exclusivity key, or an unresolved repo mapping.
fn selection_blockers(by_id: &BTreeMap<TaskId, DerivedTask>, task: &DerivedTask) -> Vec<Blocker> {
    let mut blockers = Vec::new();

    let deps_done = task.dependencies.iter().all(|dep| {
        by_id
            .get(dep)
            .map(|d| d.column() == Column::Done)
            .unwrap_or(true)
    });
    if !deps_done {
        blockers.push(Blocker::Deps);
    }

    if let Some(key) = &task.exclusivity_key {
        let contended = by_id
            .values()
            .any(|other| other.id() != task.id() && other.column() == Column::Wip && other.exclusivity_key.as_deref() == Some(key.as_str()));
        if contended {
            blockers.push(Blocker::Exclusive);
        }
    }

    match &task.repo {
        kb_core::domain::RepoResolution::NoRepo => {}
        kb_core::domain::RepoResolution::Mapped { .. } => {}
        kb_core::domain::RepoResolution::Unmapped { .. } | kb_core::domain::RepoResolution::Absent => {
            blockers.push(Blocker::Repo);
        }
    }

    blockers
}
