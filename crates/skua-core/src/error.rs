use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to write HAR file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize HAR: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),
}

pub type Result<T> = std::result::Result<T, Error>;
