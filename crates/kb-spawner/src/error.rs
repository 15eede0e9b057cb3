use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("spawn command template is empty")]
    EmptyCommand,
    #[error("failed to spawn child: {0}")]
    Io(#[from] std::io::Error),
    #[error("child stdout unavailable")]
    NoStdout,
    #[error("handshake line missing or malformed: {0}")]
    Handshake(String),
    #[error("handshake did not arrive within the configured timeout")]
    Timeout,
}

impl From<SpawnError> for kb_core::KbError {
    fn from(err: SpawnError) -> Self {
        kb_core::KbError::Spawn(err.to_string())
    }
}

pub type SpawnResult<T> = Result<T, SpawnError>;
