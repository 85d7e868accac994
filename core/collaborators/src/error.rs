use para_schemas::NoteId;
use thiserror::Error;

/// Failures reported by external collaborators. Callers decide whether a
/// failure degrades the result or propagates.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("note not found: {0}")]
    NotFound(NoteId),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected response: {0}")]
    InvalidResponse(String),

    #[error("{0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, CollaboratorError>;
