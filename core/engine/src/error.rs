use para_collaborators::CollaboratorError;
use para_schemas::{NoteId, WeightTableError};
use thiserror::Error;

/// Error taxonomy of the engine.
///
/// `Input` and `CollaboratorUnavailable` are recoverable: callers degrade and
/// continue. `NotFound` is surfaced to the caller. `InvariantViolation` and
/// `Storage` are hard failures.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("malformed input: {0}")]
    Input(String),

    #[error("{collaborator} unavailable: {reason}")]
    CollaboratorUnavailable {
        collaborator: &'static str,
        reason: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn unavailable(collaborator: &'static str, reason: impl ToString) -> Self {
        EngineError::CollaboratorUnavailable {
            collaborator,
            reason: reason.to_string(),
        }
    }

    pub fn note_not_found(note_id: &NoteId) -> Self {
        EngineError::NotFound(format!("note {}", note_id))
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::Input(_) | EngineError::CollaboratorUnavailable { .. }
        )
    }
}

impl From<WeightTableError> for EngineError {
    fn from(err: WeightTableError) -> Self {
        EngineError::InvariantViolation(format!("weight table: {}", err))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Storage(rusqlite::Error::ToSqlConversionFailure(Box::new(err)))
    }
}

impl From<CollaboratorError> for EngineError {
    fn from(err: CollaboratorError) -> Self {
        match err {
            CollaboratorError::NotFound(note_id) => EngineError::note_not_found(&note_id),
            other => EngineError::unavailable("collaborator", other),
        }
    }
}
