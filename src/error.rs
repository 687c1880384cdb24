//! Error types shared by the session core and the tool surface.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Absolute, empty or escaping path supplied by a caller.
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("invalid session_id '{0}' (use init to create one)")]
    SessionNotFound(String),

    #[error("session limit reached ({max} live sessions); close a session or retry later")]
    CapacityExceeded { max: usize },

    #[error("container operation failed: {0:#}")]
    Container(#[from] anyhow::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn invalid_path(path: impl AsRef<std::path::Path>, reason: &'static str) -> Self {
        Error::InvalidPath {
            path: path.as_ref().display().to_string(),
            reason,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
