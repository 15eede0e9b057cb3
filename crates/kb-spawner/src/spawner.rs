//! Child-process spawner: command templating plus the one-line JSON stdout
//! handshake (spec §4.E).
//!
//! Grounded on `agentor-builtins/src/shell.rs` (`tokio::process::Command`,
//! `tokio::time::timeout` wrapping the child interaction) and
//! `agentor-mcp/src/client.rs` (line-based JSON read off a child's stdout).

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use kb_core::domain::{DocsEntry, ReviewerEntry, RunEntry, RunKind, TaskId, WorkerEntry};

use crate::error::{SpawnError, SpawnResult};

/// Inputs to a spawn call, substituted into the configured command
/// template (spec §4.E: "positional arguments `(taskId, repoKey,
/// repoPath, ...)`").
#[derive(Debug, Clone, Default)]
pub struct SpawnSpec {
    pub task_id: TaskId,
    pub repo_key: Option<String>,
    pub repo_path: Option<PathBuf>,
    /// Set for reviewer/docs spawns that need the worker's patch.
    pub patch_path: Option<PathBuf>,
    /// Set for reviewer spawns only: the revision the reviewer is being
    /// asked to evaluate (spec §4.D recovery-eligibility).
    pub patch_revision: Option<String>,
}

impl SpawnSpec {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Handshake {
    exec_session_id: String,
    run_id: String,
    run_dir: PathBuf,
    #[allow(dead_code)]
    log_path: PathBuf,
    #[serde(default)]
    patch_path: Option<PathBuf>,
    #[serde(default)]
    comment_path: Option<PathBuf>,
    #[serde(default)]
    done_path: Option<PathBuf>,
    #[serde(default)]
    result_path: Option<PathBuf>,
    started_at_ms: i64,
}

/// Renders a command template, replacing `{task_id}`, `{repo_key}`,
/// `{repo_path}`, `{patch_path}` tokens with `spec`'s values. Missing
/// optional values substitute the empty string.
pub fn render_command(template: &[String], spec: &SpawnSpec) -> SpawnResult<Vec<String>> {
    if template.is_empty() {
        return Err(SpawnError::EmptyCommand);
    }
    let repo_key = spec.repo_key.clone().unwrap_or_default();
    let repo_path = spec
        .repo_path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let patch_path = spec
        .patch_path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();

    let rendered = template
        .iter()
        .map(|arg| {
            arg.replace("{task_id}", &spec.task_id.0.to_string())
                .replace("{repo_key}", &repo_key)
                .replace("{repo_path}", &repo_path)
                .replace("{patch_path}", &patch_path)
        })
        .collect();
    Ok(rendered)
}

/// Spawns worker/reviewer/docs children and validates their handshake.
pub struct Spawner {
    handshake_timeout: Duration,
}

impl Spawner {
    pub fn new(handshake_timeout: Duration) -> Self {
        Self { handshake_timeout }
    }

    /// Spawn one child for `kind`, wait (bounded) for its handshake line,
    /// and build the matching `RunEntry`. The child keeps running after
    /// the handshake; it's reaped by a detached background task so it
    /// never becomes a zombie.
    pub async fn spawn(
        &self,
        kind: RunKind,
        template: &[String],
        spec: &SpawnSpec,
    ) -> SpawnResult<RunEntry> {
        let argv = render_command(template, spec)?;
        let (program, args) = argv.split_first().ok_or(SpawnError::EmptyCommand)?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = command.spawn()?;
        let stdout = child.stdout.take().ok_or(SpawnError::NoStdout)?;
        let mut reader = BufReader::new(stdout);
        let mut line = String::new();

        let read = tokio::time::timeout(self.handshake_timeout, reader.read_line(&mut line)).await;
        let handshake = match read {
            Ok(Ok(0)) => {
                return Err(SpawnError::Handshake(
                    "child closed stdout before writing a handshake line".into(),
                ))
            }
            Ok(Ok(_)) => parse_handshake(&line)?,
            Ok(Err(e)) => return Err(SpawnError::Io(e)),
            Err(_) => return Err(SpawnError::Timeout),
        };

        info!(
            task_id = spec.task_id.0,
            kind = %kind,
            run_id = %handshake.run_id,
            "child handshake accepted"
        );

        tokio::spawn(async move {
            if let Err(e) = child.wait().await {
                warn!(error = %e, "error reaping spawned child");
            }
        });

        build_entry(kind, spec, handshake)
    }
}

fn parse_handshake(line: &str) -> SpawnResult<Handshake> {
    serde_json::from_str(line.trim()).map_err(|e| SpawnError::Handshake(e.to_string()))
}

fn build_entry(kind: RunKind, spec: &SpawnSpec, handshake: Handshake) -> SpawnResult<RunEntry> {
    let run_id = kb_core::domain::RunId(handshake.run_id);
    match kind {
        RunKind::Worker => Ok(RunEntry::Worker(WorkerEntry {
            run_id,
            run_dir: handshake.run_dir,
            done_path: handshake
                .done_path
                .ok_or_else(|| SpawnError::Handshake("worker handshake missing donePath".into()))?,
            patch_path: handshake
                .patch_path
                .ok_or_else(|| SpawnError::Handshake("worker handshake missing patchPath".into()))?,
            comment_path: handshake.comment_path.ok_or_else(|| {
                SpawnError::Handshake("worker handshake missing commentPath".into())
            })?,
            started_at_ms: handshake.started_at_ms,
            exec_session_id: Some(handshake.exec_session_id),
            repo_key: spec.repo_key.clone(),
            repo_path: spec.repo_path.clone(),
        })),
        RunKind::Reviewer => Ok(RunEntry::Reviewer(ReviewerEntry {
            run_id,
            run_dir: handshake.run_dir,
            result_path: handshake.result_path.ok_or_else(|| {
                SpawnError::Handshake("reviewer handshake missing resultPath".into())
            })?,
            started_at_ms: handshake.started_at_ms,
            exec_session_id: Some(handshake.exec_session_id),
            patch_revision: spec.patch_revision.clone().unwrap_or_default(),
        })),
        RunKind::Docs => Ok(RunEntry::Docs(DocsEntry {
            run_id,
            run_dir: handshake.run_dir,
            done_path: handshake
                .done_path
                .ok_or_else(|| SpawnError::Handshake("docs handshake missing donePath".into()))?,
            patch_path: handshake
                .patch_path
                .ok_or_else(|| SpawnError::Handshake("docs handshake missing patchPath".into()))?,
            comment_path: handshake
                .comment_path
                .ok_or_else(|| SpawnError::Handshake("docs handshake missing commentPath".into()))?,
            started_at_ms: handshake.started_at_ms,
            exec_session_id: Some(handshake.exec_session_id),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_placeholders() {
        let template = vec![
            "./spawn-worker.sh".to_string(),
            "{task_id}".to_string(),
            "{repo_key}".to_string(),
            "{repo_path}".to_string(),
        ];
        let mut spec = SpawnSpec::new(TaskId(42));
        spec.repo_key = Some("server".into());
        spec.repo_path = Some(PathBuf::from("/repos/server"));
        let rendered = render_command(&template, &spec).unwrap();
        assert_eq!(
            rendered,
            vec!["./spawn-worker.sh", "42", "server", "/repos/server"]
        );
    }

    #[test]
    fn empty_template_is_rejected() {
        let spec = SpawnSpec::new(TaskId(1));
        assert!(matches!(render_command(&[], &spec), Err(SpawnError::EmptyCommand)));
    }

    #[tokio::test]
    async fn spawn_rejects_malformed_handshake() {
        let spawner = Spawner::new(Duration::from_secs(2));
        let template = vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo not-json".to_string(),
        ];
        let spec = SpawnSpec::new(TaskId(1));
        let result = spawner.spawn(RunKind::Worker, &template, &spec).await;
        assert!(matches!(result, Err(SpawnError::Handshake(_))));
    }

    #[tokio::test]
    async fn spawn_accepts_valid_worker_handshake() {
        let spawner = Spawner::new(Duration::from_secs(2));
        let script = r#"echo '{"execSessionId":"s1","runId":"r1","runDir":"/tmp/r","logPath":"/tmp/r/worker.log","patchPath":"/tmp/r/patch.patch","commentPath":"/tmp/r/kanboard-comment.md","donePath":"/tmp/r/done.json","startedAtMs":1}'"#;
        let template = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
        let spec = SpawnSpec::new(TaskId(9));
        let entry = spawner
            .spawn(RunKind::Worker, &template, &spec)
            .await
            .unwrap();
        match entry {
            RunEntry::Worker(w) => assert_eq!(w.run_id.0, "r1"),
            _ => panic!("expected worker entry"),
        }
    }
}
