use thiserror::Error;

/// Convenience `Result` alias using [`KbError`].
pub type KbResult<T> = Result<T, KbError>;

/// Top-level error type for the orchestrator.
///
/// Each variant corresponds to an error kind named in spec §7; subsystem
/// crates define their own narrower errors and convert into this one at
/// the boundary the reconciler calls across.
#[derive(Error, Debug)]
pub enum KbError {
    /// Board JSON-RPC call failed (network, 5xx, or a 4xx with semantic
    /// meaning).
    #[error("board error: {0}")]
    Board(String),

    /// The tick lock is held by another process.
    #[error("lock contention: {0}")]
    LockContention(String),

    /// A run artifact (`done.json`/`review.json`) failed validation.
    #[error("artifact invalid: {0}")]
    ArtifactInvalid(String),

    /// Spawning a worker/reviewer/docs child failed, or its handshake was
    /// malformed.
    #[error("spawn error: {0}")]
    Spawn(String),

    /// The state document could not be persisted.
    #[error("state persist failed: {0}")]
    StatePersistFailed(String),

    /// Configuration is missing, malformed, or internally inconsistent.
    #[error("config error: {0}")]
    Config(String),

    /// A serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
