use thiserror::Error;

/// Errors raised while parsing session ids and document names.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("document name must look like <session>/<name>, got {0:?}")]
    MissingSeparator(String),

    #[error("invalid session id {0:?}")]
    InvalidSession(String),

    #[error("invalid page name {0:?}")]
    InvalidLogicalName(String),
}

/// Errors produced by the merge engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    /// Malformed operation shape. Never applied, never broadcast.
    #[error("invalid operation: {0}")]
    Validation(String),

    /// The base version fell out of the retained history.
    #[error("operation based on version {base_version} is too old (oldest transformable base is {oldest_available})")]
    Stale {
        base_version: u64,
        oldest_available: u64,
    },

    /// Strict application found text that does not match the operation.
    #[error("operation does not fit the document: {0}")]
    Mismatch(String),
}

impl From<NameError> for MergeError {
    fn from(e: NameError) -> Self {
        MergeError::Validation(e.to_string())
    }
}
