use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    /// The operation is not allowed in the proxy's current state
    #[error("Invalid state: {0}")]
    State(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Har(#[from] skua_core::Error),
}

impl Error {
    pub(crate) fn state(message: impl Into<String>) -> Self {
        Error::State(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
