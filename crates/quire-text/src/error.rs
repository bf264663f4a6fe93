//! Error types for the text CRDT.

use thiserror::Error;

/// Errors raised while applying operations or restoring state.
///
/// None of these leave a document partially modified.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    #[error("Malformed operation {id}: {reason}")]
    Malformed { id: String, reason: String },

    #[error("Invalid index: {index} (length: {length})")]
    IndexOutOfBounds { index: usize, length: usize },

    #[error("Invalid document state: {0}")]
    InvalidState(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DocumentError {
    pub(crate) fn malformed(id: impl ToString, reason: impl Into<String>) -> Self {
        DocumentError::Malformed {
            id: id.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for DocumentError {
    fn from(err: serde_json::Error) -> Self {
        DocumentError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DocumentError>;
