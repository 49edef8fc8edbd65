//! Error kinds surfaced by the indexing and search core.
//!
//! Reconstruction anomalies (dangling replies, cycles) are never errors;
//! they are resolved in [`crate::threads`]. Everything else that can go
//! wrong between the message stream and a served query maps to one of
//! these variants, so callers at the serving boundary can tell a
//! rejected query apart from an empty result set.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Input record missing required fields or not parseable.
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// Vector rows and metadata lines disagree. Fatal at load time.
    #[error("Index consistency error: {0}")]
    Consistency(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Collaborator call failed in a retryable way (transport, rate limit, timeout).
    #[error("Collaborator unavailable: {0}")]
    CollaboratorTransient(String),

    /// Collaborator rejected the input.
    #[error("Collaborator error: {0}")]
    CollaboratorPermanent(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn consistency(vector_rows: usize, metadata_rows: usize) -> Self {
        Error::Consistency(format!(
            "vector matrix has {} rows but metadata has {} lines",
            vector_rows, metadata_rows
        ))
    }

    /// Whether re-running the failed operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::CollaboratorTransient(_) | Error::Io(_))
    }
}
