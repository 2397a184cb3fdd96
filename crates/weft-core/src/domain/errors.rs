//! Engine errors and their operational classification.

use thiserror::Error;

use crate::ports::template::RenderError;

/// How an executor should treat an error.
///
/// - Rejected: the request itself is wrong (bad argument or state); do not retry.
/// - Missing: a referenced flow or execution does not exist.
/// - Corruption: an internal invariant was broken; upstream data is suspect.
/// - Collaborator: a port failed; retrying later may succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Rejected,
    Missing,
    Corruption,
    Collaborator,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error(transparent)]
    TemplateRender(#[from] RenderError),

    #[error("store failure: {0}")]
    Store(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidArgument(_)
            | EngineError::InvalidState(_)
            | EngineError::TemplateRender(_) => ErrorKind::Rejected,
            EngineError::NotFound(_) => ErrorKind::Missing,
            EngineError::InvariantViolation(_) => ErrorKind::Corruption,
            EngineError::Store(_) => ErrorKind::Collaborator,
        }
    }

    /// Builds an `InvariantViolation`, logging it at error level first.
    pub fn invariant(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(%message, "invariant violation");
        EngineError::InvariantViolation(message)
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        assert_eq!(
            EngineError::InvalidArgument("x".into()).kind(),
            ErrorKind::Rejected
        );
        assert_eq!(EngineError::NotFound("x".into()).kind(), ErrorKind::Missing);
        assert_eq!(EngineError::invariant("x").kind(), ErrorKind::Corruption);
        assert_eq!(EngineError::Store("x".into()).kind(), ErrorKind::Collaborator);

        let render: EngineError = RenderError::UnknownVariable("a.b".into()).into();
        assert_eq!(render.kind(), ErrorKind::Rejected);
        assert_eq!(render.to_string(), "unknown template variable 'a.b'");
    }
}
