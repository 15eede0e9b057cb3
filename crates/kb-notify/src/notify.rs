//! Fire-and-forget notification sink.
//!
//! Grounded on `agentor-channels/src/slack.rs` (`SlackChannel::send`), here
//! reduced from an HTTP channel to a configured external command, since
//! spec §4.K only requires "best-effort, never fails the tick" rather than
//! a specific transport. The deny-list and error-swallowing discipline are
//! carried over directly.

use std::process::Stdio;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tracing::warn;

use kb_core::domain::TaskId;

/// One tick's operator-visible summary (spec §7): moves performed, spawns
/// started, and the first line of any errors encountered.
#[derive(Debug, Clone, Serialize)]
pub struct TickSummary {
    pub moves: u32,
    pub spawns: u32,
    pub error_count: u32,
    pub first_error: Option<String>,
}

/// Sink for operator-visible notifications. Implementations must swallow
/// their own errors; nothing here may abort a tick.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_blocker(&self, id: TaskId, message: &str);
    async fn notify_tick_summary(&self, summary: &TickSummary);
}

/// Drops every notification. Used when `notifyCmd` is unset.
#[derive(Debug, Default)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify_blocker(&self, _id: TaskId, _message: &str) {}
    async fn notify_tick_summary(&self, _summary: &TickSummary) {}
}

/// Invokes a configured external command with the notification payload as
/// a trailing JSON argument.
pub struct CommandNotifier {
    command: Vec<String>,
    deny_targets: Vec<String>,
}

impl CommandNotifier {
    pub fn new(command: Vec<String>, deny_targets: Vec<String>) -> Self {
        Self {
            command,
            deny_targets,
        }
    }

    fn is_denied(&self, target: &str) -> bool {
        self.deny_targets.iter().any(|d| d == target)
    }

    async fn fire(&self, target: &str, payload: &serde_json::Value) {
        if self.command.is_empty() {
            return;
        }
        if self.is_denied(target) {
            warn!(target, "notification suppressed by deny list");
            return;
        }
        let Some((program, args)) = self.command.split_first() else {
            return;
        };
        let body = payload.to_string();
        let result = Command::new(program)
            .args(args)
            .arg(&body)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = result {
            warn!(error = %e, target, "notification command failed to launch");
        }
    }
}

#[async_trait]
impl Notifier for CommandNotifier {
    async fn notify_blocker(&self, id: TaskId, message: &str) {
        let payload = serde_json::json!({ "kind": "blocker", "taskId": id.0, "message": message });
        self.fire("blocker", &payload).await;
    }

    async fn notify_tick_summary(&self, summary: &TickSummary) {
        let payload = serde_json::to_value(summary).unwrap_or(serde_json::Value::Null);
        self.fire("tick-summary", &payload).await;
    }
}
