//! Thrash and cooldown guards applied to a policy-emitted action list
//! before it reaches the board (spec §4.I). These need cross-tick history
//! the pure policy engine deliberately doesn't carry, so they run here,
//! between `kb_policy::policy` and the reconciler's apply loop.
//!
//! Grounded on `agentor-orchestrator/src/scheduler.rs`'s windowed
//! time-comparison style (`chrono::Duration` arithmetic over a fire-time
//! history) adapted from "is this job due to run" to "is this task due to
//! cool down".

use kb_core::config::Config;
use kb_core::domain::{Action, Column, PauseReason, RunKind, State};

/// Spec §4.I respawn thrash: a worker `SpawnRun` is replaced with a pause
/// instead of going out if the task has already been respawned more than
/// `maxRespawns` times within `thrashWindowMin`. Review rework thrash is a
/// distinct rule the policy engine already enforces itself.
pub fn apply_respawn_thrash(actions: Vec<Action>, state: &State, config: &Config, now_ms: i64) -> Vec<Action> {
    let window_start = now_ms - config.thrash_window_min * 60_000;
    let mut out = Vec::with_capacity(actions.len());
    for action in actions {
        if let Action::SpawnRun { kind: RunKind::Worker, id } = &action {
            let count = state
                .respawn_history_by_task_id
                .get(id)
                .map(|history| history.iter().filter(|ms| **ms >= window_start).count())
                .unwrap_or(0);
            if count as u32 > config.max_respawns {
                out.push(Action::AddTag { id: *id, tag: "paused".to_string() });
                out.push(Action::AddTag {
                    id: *id,
                    tag: PauseReason::Thrash.tag().to_string(),
                });
                continue;
            }
        }
        out.push(action);
    }
    out
}

/// Groups consecutive same-task actions into atomic units, e.g. a
/// `MoveTask{to:Review}` immediately followed by its `ClearEntry{Worker}`.
/// Both the cooldown filter and the budget clamp need this same grouping so
/// neither one can split a unit and let half of it through.
fn group_into_units(actions: Vec<Action>) -> Vec<Vec<Action>> {
    let mut units: Vec<Vec<Action>> = Vec::new();
    for action in actions {
        let task = action.task_id();
        let continues_last = task.is_some()
            && units.last().and_then(|unit| unit.last()).and_then(Action::task_id) == task;
        if continues_last {
            units.last_mut().expect("checked by continues_last").push(action);
        } else {
            units.push(vec![action]);
        }
    }
    units
}

/// Spec §4.I move cooldown: reject a repeated move of the same task within
/// `cooldownMin` of its last recorded action. `Ready -> Wip` is exempt, since
/// that's the only move destination the promotion/critical/rework phases
/// ever emit and the spec calls it out by name.
///
/// Operates on whole task units, not bare `MoveTask` actions: a cooldown-
/// blocked move's sibling actions in the same unit (e.g. `ClearEntry`) are
/// dropped along with it, so a task never ends up moved-in-place without its
/// entry or pause tag (invariant 1).
pub fn filter_cooldown(actions: Vec<Action>, state: &State, now_ms: i64, cooldown_min: i64) -> Vec<Action> {
    let mut kept = Vec::new();
    for unit in group_into_units(actions) {
        let blocked = unit.iter().any(|action| match action {
            Action::MoveTask { id, to } if *to != Column::Wip => {
                match state.last_actions_by_task_id.get(id) {
                    Some(last) => now_ms - last < cooldown_min * 60_000,
                    None => false,
                }
            }
            _ => false,
        });
        if !blocked {
            kept.extend(unit);
        }
    }
    kept
}

/// Spec §4.H action budget: a unit of consecutive same-task actions counts
/// once against `budget` if any action in it is board-mutating. Once
/// `budget` units have been charged, later units are dropped whole,
/// implementing "WIP<->Review/Spawn pairs count as one logical move".
pub fn clamp_action_budget(actions: Vec<Action>, budget: u32) -> Vec<Action> {
    let mut kept = Vec::new();
    let mut spent = 0u32;
    for unit in group_into_units(actions) {
        let mutating = unit.iter().any(Action::counts_against_budget);
        if mutating {
            if spent >= budget {
                continue;
            }
            spent += 1;
        }
        kept.extend(unit);
    }
    kept
}

/// Applies all three guards in the order the reconciler runs them: thrash
/// substitution first (so a blocked respawn's pause tags are themselves
/// subject to cooldown/budget like any other action), then cooldown, then
/// the budget clamp last since it's the only one that drops whole units.
pub fn apply_guards(actions: Vec<Action>, state: &State, config: &Config, now_ms: i64) -> Vec<Action> {
    let thrash_checked = apply_respawn_thrash(actions, state, config, now_ms);
    let cooled = filter_cooldown(thrash_checked, state, now_ms, config.cooldown_min);
    clamp_action_budget(cooled, config.action_budget)
}
