use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunsError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("artifact {path} invalid: {reason}")]
    Invalid { path: String, reason: String },
    #[error("json error at {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl From<RunsError> for kb_core::KbError {
    fn from(err: RunsError) -> Self {
        kb_core::KbError::ArtifactInvalid(err.to_string())
    }
}

pub type RunsResult<T> = Result<T, RunsError>;
