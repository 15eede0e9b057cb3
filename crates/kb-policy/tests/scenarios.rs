//! End-to-end scenario and invariant tests for the decision engine.
//!
//! Grounded on `agentor-orchestrator/tests/engine_test.rs`'s style of
//! constructing a synthetic world and asserting on the emitted plan.

use std::collections::BTreeMap;
use std::path::PathBuf;

use kb_classifier::classify;
use kb_core::config::{Config, MissingWorkerPolicy};
use kb_core::domain::{
    Action, Column, DerivedTask, RunKind, State, Task, TaskId, WorkerEntry,
};
use kb_policy::{policy, PolicyContext, Signals};

fn task(id: u64, column: Column, position: i64, title: &str, tags: &[&str]) -> Task {
    Task {
        id: TaskId(id),
        column,
        position,
        title: title.to_string(),
        description: String::new(),
        tags: tags.iter().map(|s| s.to_string()).collect(),
    }
}

fn derive(t: &Task) -> DerivedTask {
    classify(t, &BTreeMap::new(), false)
}

fn test_config() -> Config {
    Config {
        tick_seconds: 60,
        action_budget: 100,
        cooldown_min: 30,
        wip_limit: 2,
        review_threshold: 90,
        review_auto_done: false,
        missing_worker_policy: MissingWorkerPolicy::Spawn,
        thrash_window_min: 60,
        max_respawns: 3,
        max_reworks_per_revision: 2,
        allow_title_repo_hint: false,
        lock_strategy: Default::default(),
        lock_wait_ms: 0,
        runs_root: PathBuf::from("runs"),
        state_root: PathBuf::from("state"),
        heartbeat_path: PathBuf::from("state/heartbeat.json"),
        worker_spawn_cmd: vec!["./spawn-worker.sh".into()],
        reviewer_spawn_cmd: vec!["./spawn-reviewer.sh".into()],
        docs_spawn_cmd: vec!["./spawn-docs.sh".into()],
        notify_cmd: None,
        notify_deny_targets: Vec::new(),
        board_url: "http://localhost/jsonrpc".into(),
        board_user: "orchestrator".into(),
        board_password_env: "KB_BOARD_PASSWORD".into(),
        docs_column_title: "Documentation".into(),
        tick_budget_ms: 45_000,
        board_call_timeout_ms: 10_000,
        board_call_retries: 2,
        spawn_handshake_ms: 5_000,
        stale_worker_ms: 30 * 60 * 1000,
        swimlane_priority: Vec::new(),
        bring_up_cmd: None,
        heartbeat_stale_multiplier: 3,
        guardian_check_ms: 15_000,
        restart_history_window_min: 60,
        max_restarts_per_window: 3,
    }
}

fn ctx<'a>(state: &'a State, signals: &'a Signals, config: &'a Config) -> PolicyContext<'a> {
    PolicyContext {
        state,
        signals,
        config,
        docs_column_present: true,
        now_ms: 1_700_000_000_000,
    }
}

#[test]
fn s1_epic_breakdown_is_idempotent() {
    let epic = task(10, Column::Backlog, 0, "E", &["epic"]);
    let tasks = vec![derive(&epic)];
    let state = State::default();
    let signals = Signals::default();
    let config = test_config();
    let c = ctx(&state, &signals, &config);

    let actions = policy(&tasks, &c);
    assert_eq!(
        actions,
        vec![Action::CreateTask {
            column: Column::Backlog,
            title: "Break down epic #10: E".into(),
            description: String::new(),
            tags: Default::default(),
        }]
    );

    // Tick 2: the companion task already exists, nothing more is created.
    let companion = task(11, Column::Backlog, 1, "Break down epic #10: E", &[]);
    let tasks2 = vec![derive(&epic), derive(&companion)];
    let actions2 = policy(&tasks2, &c);
    assert!(actions2.iter().all(|a| !matches!(a, Action::CreateTask { .. })));
}

#[test]
fn s2_promotion_spawns_a_worker() {
    let mut repo_map = BTreeMap::new();
    repo_map.insert("server".to_string(), PathBuf::from("/p/s"));
    let raw = task(20, Column::Backlog, 0, "server: do thing", &["repo:server"]);
    let derived = classify(&raw, &repo_map, false);

    let state = State::default();
    let signals = Signals::default();
    let config = test_config();
    let c = ctx(&state, &signals, &config);

    let actions = policy(&[derived], &c);
    assert_eq!(
        actions,
        vec![
            Action::MoveTask { id: TaskId(20), to: Column::Ready },
            Action::MoveTask { id: TaskId(20), to: Column::Wip },
            Action::SpawnRun { kind: RunKind::Worker, id: TaskId(20) },
        ]
    );
}

#[test]
fn s3_critical_preempts_and_pauses_wip() {
    let t30 = task(30, Column::Wip, 0, "A", &[]);
    let t31 = task(31, Column::Wip, 1, "B", &[]);
    let t40 = task(40, Column::Backlog, 0, "C", &["critical", "repo:server"]);
    let mut repo_map = BTreeMap::new();
    repo_map.insert("server".to_string(), PathBuf::from("/p/s"));

    let tasks = vec![
        classify(&t30, &repo_map, false),
        classify(&t31, &repo_map, false),
        classify(&t40, &repo_map, false),
    ];
    let state = State::default();
    let signals = Signals::default();
    let mut config = test_config();
    config.wip_limit = 2;
    let c = ctx(&state, &signals, &config);

    let actions = policy(&tasks, &c);

    assert!(actions.contains(&Action::MoveTask { id: TaskId(40), to: Column::Ready }));
    assert!(actions.contains(&Action::MoveTask { id: TaskId(40), to: Column::Wip }));
    assert!(actions.contains(&Action::SpawnRun { kind: RunKind::Worker, id: TaskId(40) }));
    for id in [TaskId(30), TaskId(31)] {
        assert!(actions.contains(&Action::AddTag { id, tag: "paused".into() }));
        assert!(actions.contains(&Action::AddTag { id, tag: "paused:critical".into() }));
    }
    // No other promotion happened: only the critical's own moves/spawn.
    assert_eq!(
        actions.iter().filter(|a| matches!(a, Action::SpawnRun { .. })).count(),
        1
    );
}

#[test]
fn s4_review_rework_returns_to_wip_with_capacity() {
    use kb_core::domain::{ReviewResult, ReviewerEntry, RunId, Verdict};
    use kb_policy::{ReviewSignal, WipSignal};

    let t50 = task(50, Column::Review, 0, "D", &["review:auto"]);
    let wip_task = task(1, Column::Wip, 0, "filler", &[]);
    let tasks = vec![derive(&t50), derive(&wip_task)];

    let mut state = State::default();
    state.reviewers_by_task_id.insert(
        TaskId(50),
        ReviewerEntry {
            run_id: RunId("r1".into()),
            run_dir: PathBuf::from("/runs/review/task-50/r1"),
            result_path: PathBuf::from("/runs/review/task-50/r1/review.json"),
            started_at_ms: 0,
            exec_session_id: None,
            patch_revision: "rev-a".into(),
        },
    );

    let mut signals = Signals::default();
    signals.review.insert(
        TaskId(50),
        ReviewSignal {
            result: Some(ReviewResult {
                score: 60,
                verdict: Verdict::Rework,
                critical_items: vec!["oops".into()],
                notes: String::new(),
                review_revision: Some("rev-a".into()),
                stored_at_ms: 0,
            }),
        },
    );
    signals.wip.insert(TaskId(1), WipSignal::default());
    signals.current_patch_revision.insert(TaskId(50), "rev-a".into());

    let mut config = test_config();
    config.wip_limit = 2; // one slot free with one filler task already in WIP
    let c = ctx(&state, &signals, &config);

    let actions = policy(&tasks, &c);
    assert!(actions.contains(&Action::AddTag { id: TaskId(50), tag: "review:rework".into() }));
    assert!(actions.contains(&Action::AddTag { id: TaskId(50), tag: "needs-rework".into() }));
    assert!(actions.contains(&Action::MoveTask { id: TaskId(50), to: Column::Wip }));
    assert!(actions.contains(&Action::SpawnRun { kind: RunKind::Worker, id: TaskId(50) }));
}

#[test]
fn s5_missing_worker_handle_pauses_and_blocks() {
    let t60 = task(60, Column::Wip, 0, "E", &[]);
    let tasks = vec![derive(&t60)];

    let state = State::default(); // workersByTaskId[60] absent
    let signals = Signals::default();
    let mut config = test_config();
    config.missing_worker_policy = MissingWorkerPolicy::Pause;
    let c = ctx(&state, &signals, &config);

    let actions = policy(&tasks, &c);
    assert!(actions.contains(&Action::AddTag { id: TaskId(60), tag: "paused".into() }));
    assert!(actions.contains(&Action::AddTag {
        id: TaskId(60),
        tag: "paused:missing-worker".into()
    }));
    assert!(actions.contains(&Action::MoveTask { id: TaskId(60), to: Column::Blocked }));
    assert!(!actions.iter().any(|a| matches!(a, Action::SpawnRun { .. })));
}

#[test]
fn s6_dependency_gating_then_auto_heal() {
    let t69_not_done = task(69, Column::Ready, 0, "dep", &[]);
    let t70 = task(70, Column::Ready, 1, "dependent", &[]);
    let mut dependent = derive(&t70);
    dependent.dependencies.insert(TaskId(69));

    let tasks = vec![derive(&t69_not_done), dependent.clone()];
    let state = State::default();
    let signals = Signals::default();
    let mut config = test_config();
    config.wip_limit = 5;
    let c = ctx(&state, &signals, &config);

    let actions = policy(&tasks, &c);
    assert!(!actions
        .iter()
        .any(|a| matches!(a, Action::SpawnRun { id, .. } if *id == TaskId(70))));

    // 69 reaches Done: next tick auto-heals and promotes 70.
    let t69_done = task(69, Column::Done, 0, "dep", &[]);
    let t70_blocked = task(70, Column::Blocked, 1, "dependent", &["blocked:deps", "auto-blocked"]);
    let mut dependent2 = derive(&t70_blocked);
    dependent2.dependencies.insert(TaskId(69));
    let tasks2 = vec![derive(&t69_done), dependent2];

    let actions2 = policy(&tasks2, &c);
    assert!(actions2.contains(&Action::RemoveTag { id: TaskId(70), tag: "blocked:deps".into() }));
    assert!(actions2.contains(&Action::MoveTask { id: TaskId(70), to: Column::Ready }));
}

#[test]
fn wip_task_without_a_worker_entry_is_either_spawned_or_paused() {
    let t = task(5, Column::Wip, 0, "x", &[]);
    let tasks = vec![derive(&t)];
    let state = State::default(); // workersByTaskId[5] absent
    let signals = Signals::default();
    let config = test_config(); // missing_worker_policy defaults to Spawn
    let c = ctx(&state, &signals, &config);

    let actions = policy(&tasks, &c);
    let spawned = actions
        .iter()
        .any(|a| matches!(a, Action::SpawnRun { id, .. } if *id == TaskId(5)));
    let paused = actions
        .iter()
        .any(|a| matches!(a, Action::AddTag { id, tag } if *id == TaskId(5) && tag == "paused"));
    assert!(spawned || paused);
}

#[test]
fn policy_is_deterministic_given_the_same_inputs() {
    let raw = task(20, Column::Backlog, 0, "x", &["repo:server"]);
    let mut repo_map = BTreeMap::new();
    repo_map.insert("server".to_string(), PathBuf::from("/p/s"));
    let tasks = vec![classify(&raw, &repo_map, false)];
    let state = State::default();
    let signals = Signals::default();
    let config = test_config();
    let c = ctx(&state, &signals, &config);

    let first = policy(&tasks, &c);
    let second = policy(&tasks, &c);
    assert_eq!(first, second);
}

#[test]
fn state_document_round_trips_through_json() {
    let mut state = State::default();
    state.workers_by_task_id.insert(
        TaskId(1),
        WorkerEntry {
            run_id: kb_core::domain::RunId("run-1".into()),
            run_dir: PathBuf::from("/runs/worker/task-1/run-1"),
            done_path: PathBuf::from("/runs/worker/task-1/run-1/done.json"),
            patch_path: PathBuf::from("/runs/worker/task-1/run-1/patch.patch"),
            comment_path: PathBuf::from("/runs/worker/task-1/run-1/kanboard-comment.md"),
            started_at_ms: 0,
            exec_session_id: None,
            repo_key: None,
            repo_path: None,
        },
    );
    let json = serde_json::to_string(&state).unwrap();
    let parsed: State = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.workers_by_task_id.len(), state.workers_by_task_id.len());
}
