//! Run directory materialization and strict `done.json`/`review.json`
//! parsing (spec §4.D).
//!
//! Grounded on `agentor-orchestrator/src/task_queue.rs` (struct-per-entity
//! with explicit mutation methods rather than a generic CRUD layer) and
//! `agentor-session/src/store.rs` (file-backed JSON store shape).

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use kb_core::domain::{RunId, RunKind, TaskId, Verdict};

use crate::error::{RunsError, RunsResult};

/// `done.json` as written by a worker/docs child (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoneArtifact {
    pub schema_version: i64,
    pub task_id: u64,
    pub run_id: String,
    pub started_at_ms: i64,
    pub finished_at_ms: i64,
    pub exit_code: i32,
    pub ok: bool,
    pub patch_path: String,
    pub comment_path: String,
    pub patch_exists: bool,
    pub comment_exists: bool,
    pub patch_bytes: i64,
    pub comment_bytes: i64,
}

impl DoneArtifact {
    /// Spec §4.D validity rule. `kind == Docs` allows a zero-byte patch,
    /// which the caller treats as "skip" rather than failure.
    pub fn is_valid(&self, kind: RunKind) -> bool {
        if !(self.ok && self.patch_exists && self.comment_exists) {
            return false;
        }
        match kind {
            RunKind::Docs => self.patch_bytes >= 0,
            _ => self.patch_bytes > 0,
        }
    }

    /// True for a docs run whose worker legitimately produced nothing.
    pub fn is_docs_skip(&self) -> bool {
        self.patch_bytes == 0
    }
}

/// `review.json` as written by a reviewer child (spec §6), before
/// normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawReviewArtifact {
    pub score: i64,
    pub verdict: String,
    #[serde(default)]
    pub critical_items: Vec<String>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub review_revision: Option<String>,
}

impl RawReviewArtifact {
    /// Normalize into the verdict the policy engine actually acts on (spec
    /// §4.D): PASS requires the reported verdict PASS, a score at or above
    /// `threshold`, and no critical items; a reported PASS that fails either
    /// check demotes to REWORK, never silently accepted.
    pub fn normalize(&self, threshold: i64) -> Verdict {
        let reported_pass = self.verdict.eq_ignore_ascii_case("pass");
        if reported_pass && self.score >= threshold && self.critical_items.is_empty() {
            return Verdict::Pass;
        }
        if self.verdict.eq_ignore_ascii_case("blocker") {
            return Verdict::Blocker;
        }
        Verdict::Rework
    }
}

fn validate_review_shape(raw: &RawReviewArtifact, path: &Path) -> RunsResult<()> {
    if !(1..=100).contains(&raw.score) {
        return Err(RunsError::Invalid {
            path: path.display().to_string(),
            reason: format!("score {} out of range [1,100]", raw.score),
        });
    }
    let known = ["PASS", "REWORK", "BLOCKER"];
    if !known.iter().any(|v| raw.verdict.eq_ignore_ascii_case(v)) {
        return Err(RunsError::Invalid {
            path: path.display().to_string(),
            reason: format!("unrecognized verdict {:?}", raw.verdict),
        });
    }
    Ok(())
}

/// Generates run directories and validates their completion artifacts.
pub struct RunRegistry {
    runs_root: PathBuf,
}

impl RunRegistry {
    pub fn new(runs_root: impl Into<PathBuf>) -> Self {
        Self {
            runs_root: runs_root.into(),
        }
    }

    fn kind_dir(&self, kind: RunKind) -> &'static str {
        match kind {
            RunKind::Worker => "worker",
            RunKind::Reviewer => "review",
            RunKind::Docs => "docs",
        }
    }

    /// Allocate a fresh `runDir` under `runs/<kind>/task-<id>/<runId>/` and
    /// create it on disk.
    pub fn new_run_dir(&self, kind: RunKind, task_id: TaskId) -> RunsResult<(RunId, PathBuf)> {
        let run_id = RunId(generate_run_id());
        let dir = self
            .runs_root
            .join(self.kind_dir(kind))
            .join(format!("task-{}", task_id.0))
            .join(&run_id.0);
        std::fs::create_dir_all(&dir)?;
        Ok((run_id, dir))
    }

    /// The root directory a task's runs of `kind` live under, used by the
    /// stale-path and recovery-eligibility rules.
    pub fn task_root(&self, kind: RunKind, task_id: TaskId) -> PathBuf {
        self.runs_root
            .join(self.kind_dir(kind))
            .join(format!("task-{}", task_id.0))
    }

    pub fn read_done(&self, path: &Path) -> RunsResult<DoneArtifact> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|source| RunsError::Json {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn read_review(&self, path: &Path) -> RunsResult<RawReviewArtifact> {
        let raw = std::fs::read_to_string(path)?;
        let artifact: RawReviewArtifact = serde_json::from_str(&raw).map_err(|source| RunsError::Json {
            path: path.display().to_string(),
            source,
        })?;
        validate_review_shape(&artifact, path)?;
        Ok(artifact)
    }

    /// Spec §4.D stale-path rule: a completion file is only honored if it
    /// sits under the path recorded in the stored entry.
    pub fn is_authorized_path(&self, stored_entry_path: &Path, candidate: &Path) -> bool {
        candidate == stored_entry_path
    }

    /// A reviewer result is recovery-eligible iff it's under the task's
    /// review root, its `reviewRevision` matches the current patch
    /// revision, and there either is no stored `ReviewerEntry` or the
    /// stored one predates this file (spec §4.D). Among eligible results,
    /// callers should prefer the newest by file mtime.
    pub fn is_recovery_eligible(
        &self,
        review_path: &Path,
        task_id: TaskId,
        artifact: &RawReviewArtifact,
        current_patch_revision: &str,
        stored_entry_started_at_ms: Option<i64>,
        file_mtime_ms: i64,
    ) -> bool {
        let under_review_root = review_path.starts_with(self.task_root(RunKind::Reviewer, task_id));
        let revision_matches = artifact
            .review_revision
            .as_deref()
            .is_some_and(|rev| rev == current_patch_revision);
        let newer_than_stored = stored_entry_started_at_ms
            .map(|started| file_mtime_ms > started)
            .unwrap_or(true);
        under_review_root && revision_matches && newer_than_stored
    }
}

/// Content hash of the current patch bytes, used to correlate a stored
/// review against the worker output it actually reviewed. Deliberately not
/// cryptographic (`fnv1a`, not `sha2`): this identifies accidental
/// mismatches, not tamper attempts.
pub fn patch_revision(bytes: &[u8]) -> String {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    format!("{hash:016x}")
}

fn generate_run_id() -> String {
    let ts = Utc::now().format("%Y%m%dT%H%M%S%3fZ");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{ts}-{}", &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_artifact_rejects_zero_byte_patch_for_worker() {
        let artifact = sample_done(0);
        assert!(!artifact.is_valid(RunKind::Worker));
    }

    #[test]
    fn done_artifact_allows_zero_byte_patch_for_docs_as_skip() {
        let artifact = sample_done(0);
        assert!(artifact.is_valid(RunKind::Docs));
        assert!(artifact.is_docs_skip());
    }

    #[test]
    fn review_normalizes_pass_with_critical_items_to_rework() {
        let raw = RawReviewArtifact {
            score: 95,
            verdict: "PASS".into(),
            critical_items: vec!["needs tests".into()],
            notes: String::new(),
            review_revision: None,
        };
        assert_eq!(raw.normalize(90), Verdict::Rework);
    }

    #[test]
    fn review_normalizes_low_score_pass_to_rework() {
        let raw = RawReviewArtifact {
            score: 70,
            verdict: "PASS".into(),
            critical_items: vec![],
            notes: String::new(),
            review_revision: None,
        };
        assert_eq!(raw.normalize(90), Verdict::Rework);
    }

    #[test]
    fn review_accepts_genuine_pass() {
        let raw = RawReviewArtifact {
            score: 95,
            verdict: "pass".into(),
            critical_items: vec![],
            notes: String::new(),
            review_revision: None,
        };
        assert_eq!(raw.normalize(90), Verdict::Pass);
    }

    #[test]
    fn patch_revision_is_stable_and_sensitive_to_content() {
        let a = patch_revision(b"hello");
        let b = patch_revision(b"hello");
        let c = patch_revision(b"hellx");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn run_dir_is_created_under_expected_layout() {
        let dir = tempfile::tempdir().unwrap();
        let registry = RunRegistry::new(dir.path());
        let (run_id, run_dir) = registry.new_run_dir(RunKind::Worker, TaskId(42)).unwrap();
        assert!(run_dir.exists());
        assert!(run_dir.ends_with(&run_id.0));
        assert!(run_dir.to_string_lossy().contains("task-42"));
    }

    fn sample_done(patch_bytes: i64) -> DoneArtifact {
        DoneArtifact {
            schema_version: 1,
            task_id: 1,
            run_id: "r".into(),
            started_at_ms: 0,
            finished_at_ms: 1,
            exit_code: 0,
            ok: true,
            patch_path: "patch.patch".into(),
            comment_path: "kanboard-comment.md".into(),
            patch_exists: true,
            comment_exists: true,
            patch_bytes,
            comment_bytes: 10,
        }
    }
}
