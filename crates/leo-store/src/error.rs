//! Error types for the Leo store engine.

use thiserror::Error;

/// Result type alias using the library's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the Leo store engine.
///
/// Missing objects and failed optimistic preconditions are not errors: they
/// surface as `None` results from the adapter and store operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Backend error tied to a specific object path
    #[error("Storage error at {path}: {message}")]
    Storage { path: String, message: String },

    /// Transient backend error that survived the retry
    #[error("Transient backend error: {0}")]
    Transient(String),

    /// A required lock is held by another owner
    #[error("Lock held elsewhere: {0}")]
    LockHeld(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unrouteable message at dispatch time
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Compression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Encryption error
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Queue transport error
    #[error("Queue error: {0}")]
    Queue(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wrap a backend error against the object path it hit.
    pub fn storage(path: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Error::Storage {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
