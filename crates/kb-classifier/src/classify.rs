//! Pure `Task -> DerivedTask` transformation (spec §4.F).
//!
//! Grounded on `agentor-orchestrator/src/types.rs` (pure predicate methods
//! like `Task::is_ready` operating only on the struct's own fields).

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;

use kb_core::domain::{
    BlockedReason, DerivedTask, DocsPhase, PauseReason, RepoResolution, ReviewPhase, Task,
};

const REPO_TAG_PREFIX: &str = "repo:";
const EXCLUSIVE_TAG_PREFIX: &str = "exclusive:";

fn repo_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?mi)^\s*Repo:\s*(.+?)\s*$").unwrap())
}

fn depends_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?mi)^\s*(?:Depends on|Dependencies|Dependency):\s*(.+?)\s*$").unwrap()
    })
}

fn exclusive_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?mi)^\s*Exclusive:\s*(.+?)\s*$").unwrap())
}

fn id_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"#(\d+)").unwrap())
}

fn title_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([A-Za-z0-9_-]+):\s*").unwrap())
}

/// Classify one task. `repo_map` and `allow_title_repo_hint` come from
/// configuration (spec §4.F, §6).
pub fn classify(
    task: &Task,
    repo_map: &BTreeMap<String, PathBuf>,
    allow_title_repo_hint: bool,
) -> DerivedTask {
    let repo = resolve_repo(task, repo_map, allow_title_repo_hint);
    let dependencies = parse_dependencies(&task.description);
    let exclusivity_key = resolve_exclusivity(task);

    let is_critical = task.has_tag("critical");
    let hold_queued_critical = task.has_tag("hold:queued-critical");
    let is_held = task.has_tag("hold") || task.has_tag("no-auto") || task.has_tag("review:skip");
    let is_epic = task.has_tag("epic");

    let review_phases = REVIEW_PHASE_VARIANTS
        .iter()
        .copied()
        .filter(|phase| task.has_tag(review_tag(*phase)))
        .collect();
    let docs_phases = DOCS_PHASE_VARIANTS
        .iter()
        .copied()
        .filter(|phase| task.has_tag(docs_tag(*phase)))
        .collect();

    let pause_reasons: BTreeSet<PauseReason> = [
        PauseReason::Critical,
        PauseReason::MissingWorker,
        PauseReason::Thrash,
        PauseReason::StaleWorker,
    ]
    .into_iter()
    .filter(|reason| task.has_tag(reason.tag()))
    .collect();
    let paused = task.has_tag("paused") || !pause_reasons.is_empty();

    let blocked_reason = [
        BlockedReason::Deps,
        BlockedReason::Exclusive,
        BlockedReason::Repo,
        BlockedReason::Thrash,
        BlockedReason::Artifact,
    ]
    .into_iter()
    .find(|reason| task.has_tag(reason.tag()));

    DerivedTask {
        task: task.clone(),
        repo,
        dependencies,
        exclusivity_key,
        is_critical,
        is_held,
        is_epic,
        review_phases,
        docs_phases,
        paused,
        pause_reasons,
        blocked_reason,
        hold_queued_critical,
    }
}

const REVIEW_PHASE_VARIANTS: [ReviewPhase; 9] = [
    ReviewPhase::Auto,
    ReviewPhase::Pending,
    ReviewPhase::Inflight,
    ReviewPhase::Pass,
    ReviewPhase::Rework,
    ReviewPhase::Error,
    ReviewPhase::BlockedWip,
    ReviewPhase::Rerun,
    ReviewPhase::Retry,
];

const DOCS_PHASE_VARIANTS: [DocsPhase; 7] = [
    DocsPhase::Auto,
    DocsPhase::Pending,
    DocsPhase::Inflight,
    DocsPhase::Completed,
    DocsPhase::Skip,
    DocsPhase::Error,
    DocsPhase::Retry,
];

fn review_tag(phase: ReviewPhase) -> &'static str {
    match phase {
        ReviewPhase::Auto => "review:auto",
        ReviewPhase::Pending => "review:pending",
        ReviewPhase::Inflight => "review:inflight",
        ReviewPhase::Pass => "review:pass",
        ReviewPhase::Rework => "review:rework",
        ReviewPhase::Error => "review:error",
        ReviewPhase::BlockedWip => "review:blocked:wip",
        ReviewPhase::Rerun => "review:rerun",
        ReviewPhase::Retry => "review:retry",
    }
}

fn docs_tag(phase: DocsPhase) -> &'static str {
    match phase {
        DocsPhase::Auto => "docs:auto",
        DocsPhase::Pending => "docs:pending",
        DocsPhase::Inflight => "docs:inflight",
        DocsPhase::Completed => "docs:completed",
        DocsPhase::Skip => "docs:skip",
        DocsPhase::Error => "docs:error",
        DocsPhase::Retry => "docs:retry",
    }
}

fn resolve_repo(
    task: &Task,
    repo_map: &BTreeMap<String, PathBuf>,
    allow_title_repo_hint: bool,
) -> RepoResolution {
    if task.has_tag("no-repo") {
        return RepoResolution::NoRepo;
    }

    let hint = task
        .tags
        .iter()
        .find_map(|t| t.strip_prefix(REPO_TAG_PREFIX).map(str::to_string))
        .or_else(|| {
            repo_line_re()
                .captures(&task.description)
                .map(|c| c[1].to_string())
        })
        .or_else(|| {
            if allow_title_repo_hint {
                title_prefix_re()
                    .captures(&task.title)
                    .map(|c| c[1].to_string())
            } else {
                None
            }
        });

    match hint {
        None => RepoResolution::Absent,
        Some(hint) => {
            let as_path = PathBuf::from(&hint);
            if as_path.is_absolute() {
                return RepoResolution::Mapped {
                    key: hint.clone(),
                    path: as_path,
                };
            }
            match repo_map.get(&hint) {
                Some(path) => RepoResolution::Mapped {
                    key: hint,
                    path: path.clone(),
                },
                None => RepoResolution::Unmapped { hint },
            }
        }
    }
}

fn parse_dependencies(description: &str) -> BTreeSet<kb_core::domain::TaskId> {
    let line = match depends_line_re().captures(description) {
        Some(c) => c[1].to_string(),
        None => return BTreeSet::new(),
    };
    id_token_re()
        .captures_iter(&line)
        .filter_map(|c| c[1].parse::<u64>().ok())
        .map(kb_core::domain::TaskId)
        .collect()
}

fn resolve_exclusivity(task: &Task) -> Option<String> {
    let from_tags: BTreeSet<String> = task
        .tags
        .iter()
        .filter_map(|t| t.strip_prefix(EXCLUSIVE_TAG_PREFIX).map(str::to_string))
        .collect();
    let from_line: BTreeSet<String> = exclusive_line_re()
        .captures(&task.description)
        .map(|c| {
            c[1].split([',', ' '])
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let union: BTreeSet<String> = from_tags.union(&from_line).cloned().collect();
    if union.is_empty() {
        None
    } else {
        Some(union.into_iter().collect::<Vec<_>>().join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kb_core::domain::{Column, TaskId};

    fn task(description: &str, tags: &[&str]) -> Task {
        Task {
            id: TaskId(1),
            column: Column::Backlog,
            position: 0,
            title: "Add feature".to_string(),
            description: description.to_string(),
            tags: tags.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn repo_tag_wins_over_description() {
        let t = task("Repo: other", &["repo:server"]);
        let repo_map = BTreeMap::from([("server".to_string(), PathBuf::from("/repos/server"))]);
        let derived = classify(&t, &repo_map, false);
        assert_eq!(
            derived.repo,
            RepoResolution::Mapped {
                key: "server".into(),
                path: PathBuf::from("/repos/server")
            }
        );
    }

    #[test]
    fn no_repo_tag_short_circuits() {
        let t = task("Repo: server", &["no-repo"]);
        let derived = classify(&t, &BTreeMap::new(), false);
        assert_eq!(derived.repo, RepoResolution::NoRepo);
    }

    #[test]
    fn unmapped_repo_hint_is_flagged() {
        let t = task("Repo: ghost", &[]);
        let derived = classify(&t, &BTreeMap::new(), false);
        assert_eq!(derived.repo, RepoResolution::Unmapped { hint: "ghost".into() });
    }

    #[test]
    fn parses_dependencies_from_header_line() {
        let t = task("Depends on: #12, #34 #56\nmore text", &[]);
        let derived = classify(&t, &BTreeMap::new(), false);
        assert_eq!(
            derived.dependencies,
            BTreeSet::from([TaskId(12), TaskId(34), TaskId(56)])
        );
    }

    #[test]
    fn exclusivity_unions_tag_and_line() {
        let t = task("Exclusive: db, infra", &["exclusive:release"]);
        let derived = classify(&t, &BTreeMap::new(), false);
        let key = derived.exclusivity_key.unwrap();
        let mut parts: Vec<&str> = key.split(',').collect();
        parts.sort_unstable();
        assert_eq!(parts, vec!["db", "infra", "release"]);
    }

    #[test]
    fn hold_queued_critical_is_distinguished_from_plain_hold() {
        let t = task("", &["hold:queued-critical"]);
        let derived = classify(&t, &BTreeMap::new(), false);
        assert!(derived.hold_queued_critical);
    }

    #[test]
    fn review_and_docs_phase_tags_collect() {
        let t = task("", &["review:pending", "review:auto", "docs:skip"]);
        let derived = classify(&t, &BTreeMap::new(), false);
        assert!(derived.has_review_phase(ReviewPhase::Pending));
        assert!(derived.has_review_phase(ReviewPhase::Auto));
        assert!(derived.has_docs_phase(DocsPhase::Skip));
        assert!(!derived.has_docs_phase(DocsPhase::Completed));
    }
}
