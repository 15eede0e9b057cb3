//! Cross-process single-writer tick lock (spec §4.A).
//!
//! Grounded on the oddjobs daemon's lifecycle lock acquisition: open with
//! `create(true).truncate(false)` so a crashed holder's PID isn't wiped
//! before the lock is actually acquired, `try_lock_exclusive`, then write
//! the PID. The OS releases the lock automatically when the holding
//! process dies, so the default strategy here never needs a staleness TTL.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fs2::FileExt;

use crate::config::LockStrategy;
use crate::error::{KbError, KbResult};

const STALE_FILE_TTL: Duration = Duration::from_secs(10 * 60);

/// Holds the tick lock for as long as it's alive; dropping releases it.
pub struct TickLockGuard {
    #[allow(dead_code)]
    file: std::fs::File,
}

/// Acquires the single-writer tick lock per the configured strategy
/// (spec §4.A: default must not rely on a TTL).
pub struct TickLock {
    path: PathBuf,
    strategy: LockStrategy,
}

impl TickLock {
    pub fn new(path: impl Into<PathBuf>, strategy: LockStrategy) -> Self {
        Self {
            path: path.into(),
            strategy,
        }
    }

    /// Attempt to acquire the lock without blocking. Returns `Ok(None)` on
    /// contention rather than an error, so the reconciler can abort the
    /// tick cleanly (spec §4.H).
    pub fn try_acquire(&self) -> KbResult<Option<TickLockGuard>> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if self.strategy == LockStrategy::StaleFile {
            self.clear_if_stale()?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                let mut file = file;
                file.set_len(0)?;
                writeln!(file, "{}", std::process::id())?;
                Ok(Some(TickLockGuard { file }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(KbError::LockContention(format!(
                "acquiring {}: {e}",
                self.path.display()
            ))),
        }
    }

    /// Opt-in fallback: a lock file whose mtime is older than
    /// [`STALE_FILE_TTL`] is assumed to belong to a dead process and is
    /// removed before the real acquisition attempt. Never used by the
    /// default `os-lock` strategy.
    fn clear_if_stale(&self) -> KbResult<()> {
        let metadata = match std::fs::metadata(&self.path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let modified = metadata.modified()?;
        if is_older_than(modified, STALE_FILE_TTL) {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

fn is_older_than(modified: SystemTime, ttl: Duration) -> bool {
    match SystemTime::now().duration_since(modified) {
        Ok(age) => age > ttl,
        Err(_) => false,
    }
}

/// Convenience wrapper matching spec §4.H's "acquire, non-blocking, abort
/// on contention" call shape.
pub fn acquire_tick_lock(path: &Path, strategy: LockStrategy) -> KbResult<Option<TickLockGuard>> {
    TickLock::new(path, strategy).try_acquire()
}
