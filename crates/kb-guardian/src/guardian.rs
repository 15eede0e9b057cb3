//! Heartbeat staleness watcher and restart trigger (spec §4.J).
//!
//! Grounded on `agentor-orchestrator/src/scheduler.rs::Scheduler::start`'s
//! background tokio loop (sleep, then check, `tracing::info!`/`warn!`),
//! adapted from "fire jobs whose cron time has arrived" to "restart the
//! reconciler if its heartbeat has gone stale".

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{info, warn};

use kb_core::config::Config;

/// The heartbeat document the reconciler writes each tick (spec §6).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub ts: String,
    pub ts_epoch_s: i64,
    pub pid: u32,
    pub version: String,
    pub phase: String,
    pub tick_seconds: u64,
}

/// What one check cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardianOutcome {
    Healthy,
    MissingHeartbeat,
    StaleRestarted,
    StaleRestartSuppressed,
    BringUpCmdMissing,
    BringUpFailed(String),
}

/// Polls a heartbeat file and restarts the reconciler through a configured
/// command when it falls silent, tracking its own restart history so a
/// wedged reconciler can't be bounced forever.
pub struct Guardian {
    heartbeat_path: PathBuf,
    bring_up_cmd: Option<Vec<String>>,
    stale_multiplier: u32,
    restart_window_min: i64,
    max_restarts: u32,
    check_interval: Duration,
    restart_history_ms: Vec<i64>,
}

impl Guardian {
    pub fn new(config: &Config) -> Self {
        Self {
            heartbeat_path: config.heartbeat_path.clone(),
            bring_up_cmd: config.bring_up_cmd.clone(),
            stale_multiplier: config.heartbeat_stale_multiplier,
            restart_window_min: config.restart_history_window_min,
            max_restarts: config.max_restarts_per_window,
            check_interval: Duration::from_millis(config.guardian_check_ms),
            restart_history_ms: Vec::new(),
        }
    }

    /// Runs the check loop forever, sleeping `guardianCheckMs` between
    /// polls. Grounded on `agentor-orchestrator/src/scheduler.rs::Scheduler::start`'s
    /// spawn-a-loop-that-sleeps-then-checks shape.
    pub fn spawn_watch_loop(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.check_interval).await;
                let now = Utc::now();
                let outcome = self.check_once(now.timestamp(), now.timestamp_millis()).await;
                match outcome {
                    GuardianOutcome::Healthy => {}
                    other => info!(?other, "guardian check completed"),
                }
            }
        })
    }

    /// Read the heartbeat and, if stale, attempt a restart. Callers supply
    /// the current time so the loop (and its tests) don't reach for the
    /// wall clock directly.
    pub async fn check_once(&mut self, now_epoch_s: i64, now_ms: i64) -> GuardianOutcome {
        let heartbeat = match self.read_heartbeat() {
            Some(h) => h,
            None => {
                warn!(path = %self.heartbeat_path.display(), "heartbeat file missing or unreadable");
                return GuardianOutcome::MissingHeartbeat;
            }
        };

        let stale_after_s = heartbeat.tick_seconds.saturating_mul(u64::from(self.stale_multiplier));
        let age_s = (now_epoch_s - heartbeat.ts_epoch_s).max(0) as u64;
        if age_s <= stale_after_s {
            return GuardianOutcome::Healthy;
        }

        warn!(age_s, stale_after_s, "heartbeat stale, considering restart");
        self.prune_restart_history(now_ms);

        if self.restart_history_ms.len() as u32 >= self.max_restarts {
            warn!(
                restarts_in_window = self.restart_history_ms.len(),
                "restart budget exhausted for this window, not restarting again"
            );
            return GuardianOutcome::StaleRestartSuppressed;
        }

        let Some(cmd) = &self.bring_up_cmd else {
            warn!("heartbeat stale but no bringUpCmd configured");
            return GuardianOutcome::BringUpCmdMissing;
        };

        match launch(cmd).await {
            Ok(()) => {
                info!("reconciler restarted via bring-up command");
                self.restart_history_ms.push(now_ms);
                GuardianOutcome::StaleRestarted
            }
            Err(e) => {
                warn!(error = %e, "bring-up command failed to launch");
                GuardianOutcome::BringUpFailed(e)
            }
        }
    }

    fn read_heartbeat(&self) -> Option<Heartbeat> {
        let raw = std::fs::read_to_string(&self.heartbeat_path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    fn prune_restart_history(&mut self, now_ms: i64) {
        let window_start = now_ms - self.restart_window_min * 60_000;
        self.restart_history_ms.retain(|ms| *ms >= window_start);
    }
}

async fn launch(cmd: &[String]) -> Result<(), String> {
    let (program, args) = cmd.split_first().ok_or_else(|| "bringUpCmd is empty".to_string())?;
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map(|_| ())
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(heartbeat_path: PathBuf, bring_up_cmd: Option<Vec<String>>) -> Config {
        let toml = format!(
            r#"
workerSpawnCmd = ["w"]
reviewerSpawnCmd = ["r"]
docsSpawnCmd = ["d"]
boardUrl = "http://x"
boardUser = "u"
heartbeatPath = "{path}"
maxRestartsPerWindow = 1
"#,
            path = heartbeat_path.display(),
        );
        let mut cfg: Config = toml::from_str(&toml).unwrap();
        cfg.bring_up_cmd = bring_up_cmd;
        cfg
    }

    fn write_heartbeat(path: &std::path::Path, ts_epoch_s: i64, tick_seconds: u64) {
        std::fs::write(
            path,
            serde_json::json!({
                "ts": "2026-01-01T00:00:00Z",
                "tsEpochS": ts_epoch_s,
                "pid": 1,
                "version": "0.1.0",
                "phase": "idle",
                "tickSeconds": tick_seconds,
            })
            .to_string(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn fresh_heartbeat_is_healthy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heartbeat.json");
        write_heartbeat(&path, 1_000, 60);
        let mut guardian = Guardian::new(&config(path, None));
        let outcome = guardian.check_once(1_010, 1_010_000).await;
        assert_eq!(outcome, GuardianOutcome::Healthy);
    }

    #[tokio::test]
    async fn missing_heartbeat_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let mut guardian = Guardian::new(&config(path, None));
        let outcome = guardian.check_once(1_000, 1_000_000).await;
        assert_eq!(outcome, GuardianOutcome::MissingHeartbeat);
    }

    #[tokio::test]
    async fn stale_heartbeat_without_bring_up_cmd_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heartbeat.json");
        write_heartbeat(&path, 0, 60);
        let mut guardian = Guardian::new(&config(path, None));
        let outcome = guardian.check_once(1_000, 1_000_000).await;
        assert_eq!(outcome, GuardianOutcome::BringUpCmdMissing);
    }

    #[tokio::test]
    async fn stale_heartbeat_restarts_via_bring_up_cmd() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heartbeat.json");
        write_heartbeat(&path, 0, 60);
        let mut guardian = Guardian::new(&config(path, Some(vec!["true".to_string()])));
        let outcome = guardian.check_once(1_000, 1_000_000).await;
        assert_eq!(outcome, GuardianOutcome::StaleRestarted);
    }

    #[tokio::test]
    async fn restart_budget_is_enforced_within_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heartbeat.json");
        write_heartbeat(&path, 0, 60);
        let mut guardian = Guardian::new(&config(path, Some(vec!["true".to_string()])));

        let first = guardian.check_once(1_000, 1_000_000).await;
        assert_eq!(first, GuardianOutcome::StaleRestarted);

        let second = guardian.check_once(1_001, 1_001_000).await;
        assert_eq!(second, GuardianOutcome::StaleRestartSuppressed);
    }
}
