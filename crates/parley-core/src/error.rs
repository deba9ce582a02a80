use thiserror::Error;

use crate::store::StoreError;

/// Outcome of a rejected operation. Every variant is returned to the caller
/// as a value; nothing in the engine panics or escapes untyped.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("You must be logged in")]
    Unauthenticated,

    /// Also returned to non-participants, so a thread's existence is never
    /// revealed to outsiders.
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    BadInput(String),

    #[error("{0}")]
    Conflict(String),

    #[error("storage unavailable")]
    Unavailable(#[source] anyhow::Error),
}

impl ChatError {
    /// Stable machine-readable code for the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::BadInput(_) => "BAD_USER_INPUT",
            Self::Conflict(_) => "CONFLICT",
            Self::Unavailable(_) => "UNAVAILABLE",
        }
    }

    pub fn bad_input(message: impl Into<String>) -> Self {
        Self::BadInput(message.into())
    }
}

impl From<StoreError> for ChatError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict => Self::Conflict("Conflicting concurrent write".into()),
            StoreError::Backend(e) => Self::Unavailable(e),
        }
    }
}
