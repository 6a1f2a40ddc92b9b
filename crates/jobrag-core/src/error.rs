use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed question, job identifier, chunk draft or vector.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Nothing has been indexed (yet) for the requested scope.
    #[error("Index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("Retrieval timed out: {backend} exceeded {timeout_ms} ms")]
    RetrievalTimeout { backend: String, timeout_ms: u64 },

    #[error("Backend '{backend}' failed: {message}")]
    Backend { backend: String, message: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation failed: {0}")]
    Operation(String),
}

impl Error {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn backend(backend: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Backend { backend: backend.into(), message: err.to_string() }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::RetrievalTimeout { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Operation(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Operation(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
