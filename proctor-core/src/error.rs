//! Error types for proctor-core

use thiserror::Error;

/// Main error type for the proctor-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Payload could not be sealed
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Malformed or tampered ciphertext, or a submission id mismatch
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Network-level failure talking to the backend or object storage
    #[error("transport error: {0}")]
    Transport(String),

    /// Backend answered with a non-success status
    #[error("rejected by server ({status}): {body}")]
    Rejected { status: u16, body: String },

    /// Asset upload could not be completed
    #[error("upload error: {0}")]
    Upload(String),

    /// A blocking task was cancelled or panicked
    #[error("background task failed: {0}")]
    Task(String),

    /// The database connection mutex was poisoned
    #[error("lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Task(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

/// Result type alias for proctor-core
pub type Result<T> = std::result::Result<T, Error>;
