//! Tick orchestration: lock, load, snapshot, classify, decide, guard,
//! apply, persist, heartbeat (spec §4.H).
//!
//! Grounded on `agentor-orchestrator/src/engine.rs`'s `Orchestrator::run`
//! phased `plan -> execute -> synthesize` pipeline: per-phase
//! `tracing::info!` and `Instant`-measured duration, collapsed here into
//! the reconciler's fixed stage sequence since every tick runs the same
//! stages rather than a dynamically assembled plan.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, UNIX_EPOCH};

use serde::Serialize;
use tracing::{info, warn};

use kb_board::BoardPort;
use kb_classifier::classify;
use kb_core::clock::Clock;
use kb_core::config::Config;
use kb_core::domain::{
    Action, Column, DerivedTask, PausedByCritical, ReviewResult, RunEntry, RunKind, State,
    StateDelta, TaskId,
};
use kb_core::{KbError, KbResult};
use kb_notify::{CommandNotifier, NullNotifier, Notifier, TickSummary};
use kb_policy::{policy, DocsDoneStatus, DocsSignal, DoneStatus, PolicyContext, ReviewSignal, Signals, WipSignal};
use kb_runs::RunRegistry;
use kb_spawner::{SpawnSpec, Spawner};

use crate::guards::apply_guards;
use crate::state_store::StateStore;

const ALL_COLUMNS: [Column; 7] = [
    Column::Backlog,
    Column::Ready,
    Column::Wip,
    Column::Review,
    Column::Documentation,
    Column::Blocked,
    Column::Done,
];

/// Result of one call to [`Reconciler::tick`].
#[derive(Debug, Clone, Serialize)]
pub enum TickOutcome {
    /// The lock was contended; nothing was read, decided, or written.
    LockContention,
    /// The tick ran to completion.
    Applied { actions_applied: u32, errors: u32 },
}

struct ApplyOutcome {
    is_move: bool,
    is_spawn: bool,
}

/// Ties the board, run registry, spawner, classifier, policy engine, and
/// guards together into one tick.
pub struct Reconciler {
    board: Arc<dyn BoardPort>,
    registry: RunRegistry,
    spawner: Spawner,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    config: Config,
    state_store: StateStore,
    lock: kb_core::lock::TickLock,
    heartbeat_path: PathBuf,
}

impl Reconciler {
    pub fn new(board: Arc<dyn BoardPort>, config: Config, clock: Arc<dyn Clock>) -> Self {
        let registry = RunRegistry::new(config.runs_root.clone());
        let spawner = Spawner::new(Duration::from_millis(config.spawn_handshake_ms));
        let notifier: Arc<dyn Notifier> = match &config.notify_cmd {
            Some(cmd) => Arc::new(CommandNotifier::new(cmd.clone(), config.notify_deny_targets.clone())),
            None => Arc::new(NullNotifier),
        };
        let state_store = StateStore::new(config.state_root.join("state.json"));
        let lock = kb_core::lock::TickLock::new(config.state_root.join("tick.lock"), config.lock_strategy);
        let heartbeat_path = config.heartbeat_path.clone();
        Self {
            board,
            registry,
            spawner,
            notifier,
            clock,
            config,
            state_store,
            lock,
            heartbeat_path,
        }
    }

    /// Run one tick. `force_dry_run` overrides the persisted `dryRun` flag
    /// for this call only (used by the CLI's `--dry-run` flag); pass `None`
    /// to honor whatever the state document already says.
    pub async fn tick(&self, force_dry_run: Option<bool>) -> KbResult<TickOutcome> {
        let tick_start = Instant::now();

        let guard = match self.lock.try_acquire()? {
            Some(guard) => guard,
            None => {
                warn!("tick lock contended, skipping this tick");
                return Ok(TickOutcome::LockContention);
            }
        };

        let mut state = self.state_store.load();
        if let Some(force) = force_dry_run {
            state.dry_run = force;
        }
        let now_ms = self.clock.now_ms();

        let tasks = self.board.list_tasks(&ALL_COLUMNS).await?;
        info!(count = tasks.len(), "board snapshot taken");

        let derived: Vec<DerivedTask> = tasks
            .iter()
            .map(|t| classify(t, &state.repo_map, self.config.allow_title_repo_hint))
            .collect();

        let signals = self.gather_signals(&derived, &state, now_ms);

        let ctx = PolicyContext {
            state: &state,
            signals: &signals,
            config: &self.config,
            docs_column_present: !self.config.docs_column_title.is_empty(),
            now_ms,
        };
        let decided = policy(&derived, &ctx);
        let guarded = apply_guards(decided, &state, &self.config, now_ms);
        info!(decided = guarded.len(), "policy decided actions for this tick");

        let mut summary = TickSummary {
            moves: 0,
            spawns: 0,
            error_count: 0,
            first_error: None,
        };
        let mut applied = 0u32;

        if state.dry_run {
            info!(actions = guarded.len(), "dry run active: actions computed but not applied");
            for action in &guarded {
                if let Action::NotifyBlocker { id, message } = action {
                    self.notifier.notify_blocker(*id, message).await;
                }
            }
        } else {
            for action in guarded {
                match self.apply_action(action, &mut state, now_ms).await {
                    Ok(outcome) => {
                        if outcome.is_move {
                            summary.moves += 1;
                        }
                        if outcome.is_spawn {
                            summary.spawns += 1;
                        }
                        applied += 1;
                    }
                    Err(e) => {
                        warn!(error = %e, "action application failed, continuing tick");
                        summary.error_count += 1;
                        if summary.first_error.is_none() {
                            summary.first_error = Some(e.to_string());
                        }
                    }
                }
            }

            if state.dry_run_runs_remaining > 0 {
                state.dry_run_runs_remaining -= 1;
                if state.dry_run_runs_remaining == 0 {
                    state.dry_run = true;
                    info!("dry run safety re-armed");
                }
            }
        }

        self.notifier.notify_tick_summary(&summary).await;

        // Persisting is the point of no return for this tick: a failure
        // here must abort before any further mutation depends on the
        // state we just decided but couldn't record (spec §4.B).
        self.state_store.save(&state)?;
        info!(elapsed_ms = tick_start.elapsed().as_millis() as u64, "tick finished");
        self.write_heartbeat(now_ms)?;

        drop(guard);
        Ok(TickOutcome::Applied {
            actions_applied: applied,
            errors: summary.error_count,
        })
    }

    async fn apply_action(&self, action: Action, state: &mut State, now_ms: i64) -> KbResult<ApplyOutcome> {
        let mut outcome = ApplyOutcome { is_move: false, is_spawn: false };
        match action {
            Action::MoveTask { id, to } => {
                self.board.move_task(id, to).await?;
                state.last_actions_by_task_id.insert(id, now_ms);
                outcome.is_move = true;
            }
            Action::AddTag { id, tag } => {
                self.board.add_tag(id, &tag).await?;
            }
            Action::RemoveTag { id, tag } => {
                self.board.remove_tag(id, &tag).await?;
            }
            Action::PostComment { id, text } => {
                self.board.post_comment(id, &text).await?;
            }
            Action::CreateTask { column, title, description, tags } => {
                self.board.create_task(column, &title, &description, &tags).await?;
            }
            Action::SpawnRun { kind, id } => {
                self.spawn_run(kind, id, state, now_ms).await?;
                outcome.is_spawn = true;
            }
            Action::RecordEntry { id, entry } => record_entry(state, id, entry),
            Action::ClearEntry { kind, id } => clear_entry(state, kind, id),
            Action::NotifyBlocker { id, message } => {
                self.notifier.notify_blocker(id, &message).await;
            }
            Action::Persist(delta) => apply_state_delta(state, delta),
        }
        Ok(outcome)
    }

    async fn spawn_run(&self, kind: RunKind, id: TaskId, state: &mut State, now_ms: i64) -> KbResult<()> {
        let repo_key = state.repo_by_task_id.get(&id).cloned();
        let repo_path = repo_key.as_ref().and_then(|k| state.repo_map.get(k)).cloned();

        let mut spec = SpawnSpec::new(id);
        spec.repo_key = repo_key;
        spec.repo_path = repo_path;

        if matches!(kind, RunKind::Reviewer | RunKind::Docs) {
            if let Some((patch_path, bytes)) = self.locate_latest_worker_patch(id) {
                spec.patch_revision = Some(kb_runs::patch_revision(&bytes));
                spec.patch_path = Some(patch_path);
            }
        }

        let template: &[String] = match kind {
            RunKind::Worker => &self.config.worker_spawn_cmd,
            RunKind::Reviewer => &self.config.reviewer_spawn_cmd,
            RunKind::Docs => &self.config.docs_spawn_cmd,
        };

        let entry = self.spawner.spawn(kind, template, &spec).await?;
        if kind == RunKind::Worker {
            state.respawn_history_by_task_id.entry(id).or_default().push(now_ms);
        }
        record_entry(state, id, entry);
        Ok(())
    }

    /// Builds per-task [`Signals`] from recorded state entries and the run
    /// registry, for every task currently in a column the policy engine
    /// needs observations for.
    fn gather_signals(&self, derived: &[DerivedTask], state: &State, now_ms: i64) -> Signals {
        let mut signals = Signals::default();
        for task in derived {
            let id = task.id();
            match task.column() {
                Column::Wip => {
                    if let Some(entry) = state.workers_by_task_id.get(&id) {
                        let mut wip = WipSignal::default();
                        if entry.done_path.exists() {
                            wip.done = Some(match self.registry.read_done(&entry.done_path) {
                                Ok(artifact) if artifact.is_valid(RunKind::Worker) => DoneStatus::Valid,
                                _ => DoneStatus::Invalid,
                            });
                        }
                        wip.stale = worker_log_is_stale(&entry.run_dir, now_ms, self.config.stale_worker_ms);
                        signals.wip.insert(id, wip);
                    }
                }
                Column::Review => {
                    let revision = self.current_patch_revision(id, state);
                    if let Some(rev) = &revision {
                        signals.current_patch_revision.insert(id, rev.clone());
                    }
                    if let Some(result) = self.read_review_signal(id, state, revision.as_deref(), now_ms) {
                        signals.review.insert(id, ReviewSignal { result: Some(result) });
                    }
                }
                Column::Documentation => {
                    if let Some(entry) = state.docs_by_task_id.get(&id) {
                        if entry.done_path.exists() {
                            let done = match self.registry.read_done(&entry.done_path) {
                                Ok(artifact) if !artifact.is_valid(RunKind::Docs) => DocsDoneStatus::Invalid,
                                Ok(artifact) if artifact.is_docs_skip() => DocsDoneStatus::Skipped,
                                Ok(_) => DocsDoneStatus::Completed,
                                Err(_) => DocsDoneStatus::Invalid,
                            };
                            signals.docs.insert(id, DocsSignal { done: Some(done) });
                        }
                    }
                }
                _ => {}
            }
        }
        signals
    }

    /// The revision of the patch currently backing a task in Review (spec
    /// §4.D, §4.I): the recorded reviewer's own revision when a reviewer is
    /// active, else a fresh hash of the newest worker run's `patch.patch`.
    fn current_patch_revision(&self, id: TaskId, state: &State) -> Option<String> {
        if let Some(entry) = state.reviewers_by_task_id.get(&id) {
            if !entry.patch_revision.is_empty() {
                return Some(entry.patch_revision.clone());
            }
        }
        self.locate_latest_worker_patch(id)
            .map(|(_, bytes)| kb_runs::patch_revision(&bytes))
    }

    /// Newest worker run directory for `id`, by run id (timestamp-prefixed,
    /// so lexicographic order is chronological order), and its patch bytes.
    fn locate_latest_worker_patch(&self, id: TaskId) -> Option<(PathBuf, Vec<u8>)> {
        let root = self.registry.task_root(RunKind::Worker, id);
        let mut run_dirs: Vec<PathBuf> = std::fs::read_dir(&root)
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        run_dirs.sort();
        for dir in run_dirs.into_iter().rev() {
            let patch_path = dir.join("patch.patch");
            if let Ok(bytes) = std::fs::read(&patch_path) {
                return Some((patch_path, bytes));
            }
        }
        None
    }

    /// Normalized review result for a task in Review: the stored reviewer
    /// entry's result if present, else a recovery-eligible stray result
    /// under the task's review root (spec §4.D).
    fn read_review_signal(
        &self,
        id: TaskId,
        state: &State,
        current_patch_revision: Option<&str>,
        now_ms: i64,
    ) -> Option<ReviewResult> {
        let threshold = self.config.review_threshold;

        if let Some(entry) = state.reviewers_by_task_id.get(&id) {
            if !entry.result_path.exists() {
                return None;
            }
            let raw = self.registry.read_review(&entry.result_path).ok()?;
            let verdict = raw.normalize(threshold);
            return Some(ReviewResult {
                score: raw.score,
                verdict,
                critical_items: raw.critical_items,
                notes: raw.notes,
                review_revision: raw.review_revision,
                stored_at_ms: now_ms,
            });
        }

        let current_patch_revision = current_patch_revision?;
        let root = self.registry.task_root(RunKind::Reviewer, id);
        let mut candidates: Vec<PathBuf> = std::fs::read_dir(&root)
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.path().join("review.json"))
            .filter(|p| p.exists())
            .collect();
        candidates.sort_by_key(|p| mtime_ms(p));
        let path = candidates.pop()?;
        let raw = self.registry.read_review(&path).ok()?;
        let file_mtime_ms = mtime_ms(&path)?;
        if !self
            .registry
            .is_recovery_eligible(&path, id, &raw, current_patch_revision, None, file_mtime_ms)
        {
            return None;
        }
        let verdict = raw.normalize(threshold);
        Some(ReviewResult {
            score: raw.score,
            verdict,
            critical_items: raw.critical_items,
            notes: raw.notes,
            review_revision: raw.review_revision,
            stored_at_ms: now_ms,
        })
    }

    /// Writes the heartbeat the Guardian polls (spec §4.J, §6). `tickSeconds`
    /// records the configured tick period, not this tick's own duration, so
    /// the Guardian can tell how long a silence is expected to be normal.
    fn write_heartbeat(&self, now_ms: i64) -> KbResult<()> {
        if let Some(parent) = self.heartbeat_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let payload = serde_json::json!({
            "ts": chrono::Utc::now().to_rfc3339(),
            "tsEpochS": now_ms / 1000,
            "pid": std::process::id(),
            "version": env!("CARGO_PKG_VERSION"),
            "phase": "idle",
            "tickSeconds": self.config.tick_seconds,
        });
        std::fs::write(&self.heartbeat_path, serde_json::to_vec_pretty(&payload)?)?;
        Ok(())
    }
}

fn mtime_ms(path: &std::path::Path) -> Option<i64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(modified.duration_since(UNIX_EPOCH).ok()?.as_millis() as i64)
}

fn worker_log_is_stale(run_dir: &std::path::Path, now_ms: i64, stale_worker_ms: u64) -> bool {
    match mtime_ms(&run_dir.join("worker.log")) {
        Some(modified_ms) => now_ms - modified_ms > stale_worker_ms as i64,
        None => false,
    }
}

fn record_entry(state: &mut State, id: TaskId, entry: RunEntry) {
    match entry {
        RunEntry::Worker(w) => {
            state.workers_by_task_id.insert(id, w);
        }
        RunEntry::Reviewer(r) => {
            state.reviewers_by_task_id.insert(id, r);
        }
        RunEntry::Docs(d) => {
            state.docs_by_task_id.insert(id, d);
        }
    }
}

fn clear_entry(state: &mut State, kind: RunKind, id: TaskId) {
    match kind {
        RunKind::Worker => {
            state.workers_by_task_id.remove(&id);
        }
        RunKind::Reviewer => {
            state.reviewers_by_task_id.remove(&id);
        }
        RunKind::Docs => {
            state.docs_by_task_id.remove(&id);
        }
    }
}

fn apply_state_delta(state: &mut State, delta: StateDelta) {
    match delta {
        StateDelta::AppendRespawn { task, at_ms } => {
            state.respawn_history_by_task_id.entry(task).or_default().push(at_ms);
        }
        StateDelta::AppendReworkHistory { task, event } => {
            state.review_rework_history_by_task_id.entry(task).or_default().push(event);
        }
        StateDelta::SetLastAction { task, at_ms } => {
            state.last_actions_by_task_id.insert(task, at_ms);
        }
        StateDelta::SetPausedByCritical { task, why_tags_added } => {
            state.paused_by_critical.insert(task, PausedByCritical { why_tags_added });
        }
        StateDelta::ClearPausedByCritical { task } => {
            state.paused_by_critical.remove(&task);
        }
        StateDelta::SetAutoBlocked { task, reason } => {
            state.auto_blocked_by_orchestrator.insert(task, reason);
        }
        StateDelta::ClearAutoBlocked { task } => {
            state.auto_blocked_by_orchestrator.remove(&task);
        }
        StateDelta::SetReviewResult { task, result } => {
            state.review_results_by_task_id.insert(task, result);
        }
        StateDelta::SetRepoForTask { task, repo_key } => {
            state.repo_by_task_id.insert(task, repo_key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kb_core::clock::FixedClock;
    use std::collections::BTreeSet;
    use std::sync::Mutex;
    use kb_core::domain::Task;

    struct FakeBoard {
        tasks: Mutex<Vec<Task>>,
        moved: Mutex<Vec<(TaskId, Column)>>,
    }

    #[async_trait]
    impl BoardPort for FakeBoard {
        async fn list_tasks(&self, _columns: &[Column]) -> KbResult<Vec<Task>> {
            Ok(self.tasks.lock().unwrap().clone())
        }
        async fn get_task(&self, id: TaskId) -> KbResult<Task> {
            self.tasks
                .lock()
                .unwrap()
                .iter()
                .find(|t| t.id == id)
                .cloned()
                .ok_or_else(|| KbError::Board("not found".into()))
        }
        async fn move_task(&self, id: TaskId, column: Column) -> KbResult<()> {
            self.moved.lock().unwrap().push((id, column));
            if let Some(task) = self.tasks.lock().unwrap().iter_mut().find(|t| t.id == id) {
                task.column = column;
            }
            Ok(())
        }
        async fn set_position(&self, _id: TaskId, _position: i64) -> KbResult<()> {
            Ok(())
        }
        async fn add_tag(&self, id: TaskId, tag: &str) -> KbResult<()> {
            if let Some(task) = self.tasks.lock().unwrap().iter_mut().find(|t| t.id == id) {
                task.tags.insert(tag.to_string());
            }
            Ok(())
        }
        async fn remove_tag(&self, id: TaskId, tag: &str) -> KbResult<()> {
            if let Some(task) = self.tasks.lock().unwrap().iter_mut().find(|t| t.id == id) {
                task.tags.remove(tag);
            }
            Ok(())
        }
        async fn set_tags(&self, id: TaskId, tags: &BTreeSet<String>) -> KbResult<()> {
            if let Some(task) = self.tasks.lock().unwrap().iter_mut().find(|t| t.id == id) {
                task.tags = tags.clone();
            }
            Ok(())
        }
        async fn post_comment(&self, _id: TaskId, _markdown: &str) -> KbResult<()> {
            Ok(())
        }
        async fn create_task(
            &self,
            _column: Column,
            _title: &str,
            _description: &str,
            _tags: &BTreeSet<String>,
        ) -> KbResult<TaskId> {
            Ok(TaskId(999))
        }
    }

    fn ready_task(id: u64) -> Task {
        Task {
            id: TaskId(id),
            column: Column::Ready,
            position: 0,
            title: format!("task {id}"),
            description: "no-repo".to_string(),
            tags: BTreeSet::from(["no-repo".to_string()]),
        }
    }

    fn config(dir: &std::path::Path) -> Config {
        let toml = format!(
            r#"
workerSpawnCmd = ["sh", "-c", "echo '{{\"execSessionId\":\"s\",\"runId\":\"r1\",\"runDir\":\"{run_dir}\",\"logPath\":\"{run_dir}/worker.log\",\"patchPath\":\"{run_dir}/patch.patch\",\"commentPath\":\"{run_dir}/kanboard-comment.md\",\"donePath\":\"{run_dir}/done.json\",\"startedAtMs\":1}}'"]
reviewerSpawnCmd = ["sh", "-c", "exit 1"]
docsSpawnCmd = ["sh", "-c", "exit 1"]
boardUrl = "http://localhost"
boardUser = "orchestrator"
runsRoot = "{runs_root}"
stateRoot = "{state_root}"
heartbeatPath = "{heartbeat_path}"
"#,
            run_dir = dir.join("rundir").display(),
            runs_root = dir.join("runs").display(),
            state_root = dir.join("state").display(),
            heartbeat_path = dir.join("state/heartbeat.json").display(),
        );
        toml::from_str(&toml).unwrap()
    }

    #[tokio::test]
    async fn tick_promotes_a_ready_task_and_spawns_a_worker() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("rundir")).unwrap();
        let board = Arc::new(FakeBoard {
            tasks: Mutex::new(vec![ready_task(1)]),
            moved: Mutex::new(Vec::new()),
        });
        let clock = Arc::new(FixedClock::new("2026-01-01T00:00:00Z".parse().unwrap()));
        let reconciler = Reconciler::new(board.clone(), config(dir.path()), clock);

        let outcome = reconciler.tick(None).await.unwrap();
        match outcome {
            TickOutcome::Applied { actions_applied, errors } => {
                assert!(actions_applied > 0);
                assert_eq!(errors, 0);
            }
            TickOutcome::LockContention => panic!("lock should be free"),
        }

        let moved = board.moved.lock().unwrap();
        assert!(moved.iter().any(|(id, col)| *id == TaskId(1) && *col == Column::Wip));
    }

    #[tokio::test]
    async fn dry_run_decides_but_never_calls_the_board() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("rundir")).unwrap();
        let board = Arc::new(FakeBoard {
            tasks: Mutex::new(vec![ready_task(2)]),
            moved: Mutex::new(Vec::new()),
        });
        let clock = Arc::new(FixedClock::new("2026-01-01T00:00:00Z".parse().unwrap()));
        let reconciler = Reconciler::new(board.clone(), config(dir.path()), clock);

        reconciler.tick(Some(true)).await.unwrap();
        assert!(board.moved.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_concurrent_tick_reports_lock_contention() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("rundir")).unwrap();
        let board = Arc::new(FakeBoard {
            tasks: Mutex::new(vec![]),
            moved: Mutex::new(Vec::new()),
        });
        let clock = Arc::new(FixedClock::new("2026-01-01T00:00:00Z".parse().unwrap()));
        let cfg = config(dir.path());
        let lock_path = cfg.state_root.join("tick.lock");
        std::fs::create_dir_all(&cfg.state_root).unwrap();
        let held = kb_core::lock::TickLock::new(&lock_path, cfg.lock_strategy)
            .try_acquire()
            .unwrap();
        assert!(held.is_some());

        let reconciler = Reconciler::new(board, cfg, clock);
        let outcome = reconciler.tick(None).await.unwrap();
        assert!(matches!(outcome, TickOutcome::LockContention));
    }
}
