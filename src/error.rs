//! Error types for the tutor engine.
//!
//! Every fallible operation in the crate returns [`TutorError`]. The variants
//! follow how a caller is expected to react: configuration problems stop the
//! process at startup, invalid input is a caller bug, a missing eligible item
//! is recoverable, and persistence failures are surfaced without retry.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TutorError>;

#[derive(Debug, Error)]
pub enum TutorError {
    /// Bad item, topic or engine definitions. Fatal at load time.
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed numeric or categorical input passed by a caller.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Nothing can be served for the requested topic or mode.
    #[error("no eligible item: {0}")]
    NoEligibleItem(String),

    /// A question, topic or user referenced by name does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The storage collaborator failed. The engine does not retry.
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl TutorError {
    /// Returns `true` if the caller can reasonably fall back and continue.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TutorError::NoEligibleItem(_))
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        TutorError::Config(msg.into())
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        TutorError::InvalidInput(msg.into())
    }
}

impl From<rusqlite::Error> for TutorError {
    fn from(e: rusqlite::Error) -> Self {
        TutorError::Persistence(e.to_string())
    }
}
