//! Atomic persistence for the single state document (spec §4.B).
//!
//! Grounded on `agentor-session/src/store.rs` (`FileSessionStore`: one JSON
//! file per entity, plain read/write), extended with a temp-file + fsync +
//! rename sequence the teacher's store never needed for a one-writer
//! session file but this system's "never torn, never half-written" state
//! document requires.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use tracing::warn;

use kb_core::domain::State;
use kb_core::{KbError, KbResult};

/// Owns the on-disk location of the state document.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Read a deep-copied snapshot of the state document (spec §4.B). A
    /// missing or corrupt file yields fresh defaults rather than failing
    /// the tick; both cases are logged.
    pub fn load(&self) -> State {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => match serde_json::from_str::<State>(&raw) {
                Ok(state) => state,
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "state document corrupt, starting from defaults");
                    State::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %self.path.display(), "no state document found, starting from defaults");
                State::default()
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read state document, starting from defaults");
                State::default()
            }
        }
    }

    /// Serialize to a sibling temp file, fsync it, then rename over the
    /// real path so readers never observe a half-written document.
    pub fn save(&self, state: &State) -> KbResult<()> {
        let parent = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&parent)?;

        let json = serde_json::to_string_pretty(state)?;
        let tmp_path = parent.join(format!(
            ".{}.tmp-{}",
            self.path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("state"),
            std::process::id()
        ));

        let mut tmp = std::fs::File::create(&tmp_path)
            .map_err(|e| KbError::StatePersistFailed(format!("creating {}: {e}", tmp_path.display())))?;
        tmp.write_all(json.as_bytes())
            .map_err(|e| KbError::StatePersistFailed(format!("writing {}: {e}", tmp_path.display())))?;
        tmp.sync_all()
            .map_err(|e| KbError::StatePersistFailed(format!("fsync {}: {e}", tmp_path.display())))?;
        drop(tmp);

        std::fs::rename(&tmp_path, &self.path)
            .map_err(|e| KbError::StatePersistFailed(format!("renaming into {}: {e}", self.path.display())))?;
        Ok(())
    }
}
