//! Crate-wide error type.
//!
//! Mirrors the flat, `thiserror`-per-kind style used across the rest of
//! the agent runtime: callers match on variant, never on message text.

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Missing app/user/session id, a reserved state-key prefix used
    /// through the wrong channel, or another caller-supplied precondition
    /// that is never worth retrying.
    #[error("validation error: {0}")]
    Validation(String),

    /// The targeted session or event does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A create would have overwritten an existing id; the facade maps
    /// this to "return existing" before it ever reaches a caller, so this
    /// variant only surfaces out of a backend's `create` directly.
    #[error("already exists: {0}")]
    Conflict(String),

    /// Redis connection loss, command error, or script failure.
    #[error("backend error: {0}")]
    Backend(#[from] fred::error::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// The service (or one of its pools) has been closed.
    #[error("session service is shut down")]
    Shutdown,

    /// A caller-supplied cancellation signal fired before the operation
    /// could complete.
    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, SessionError>;
