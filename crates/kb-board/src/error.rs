use thiserror::Error;

#[derive(Error, Debug)]
pub enum BoardError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("column title {0:?} did not match any known column")]
    UnknownColumn(String),
}

impl From<BoardError> for kb_core::KbError {
    fn from(err: BoardError) -> Self {
        kb_core::KbError::Board(err.to_string())
    }
}

pub type BoardResult<T> = Result<T, BoardError>;
