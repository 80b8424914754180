use thiserror::Error;

use crate::types::IndexKind;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Encoding failed: {0}")]
    Encoding(String),

    #[error("{kind} index unavailable after {attempts} attempt(s): {reason}")]
    IndexUnavailable {
        kind: IndexKind,
        attempts: u32,
        reason: String,
    },

    #[error("Inconsistent index state: {0}")]
    InconsistentState(String),

    #[error("{kind} sub-search timed out after {elapsed_ms} ms")]
    SubSearchTimeout { kind: IndexKind, elapsed_ms: u64 },

    #[error("{kind} sub-search failed: {reason}")]
    SubSearchFailed { kind: IndexKind, reason: String },

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn encoding(msg: impl Into<String>) -> Self {
        Self::Encoding(msg.into())
    }

    /// A single failed backend call; the manager's retry loop bumps `attempts`.
    pub fn unavailable(kind: IndexKind, reason: impl Into<String>) -> Self {
        Self::IndexUnavailable { kind, attempts: 1, reason: reason.into() }
    }

    pub fn poisoned(kind: IndexKind) -> Self {
        Self::InconsistentState(format!("{kind} index lock poisoned"))
    }

    /// Only transient backend failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::IndexUnavailable { .. })
    }

    /// Integrity faults need an operator; nothing in the engine recovers them.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InconsistentState(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
