use thiserror::Error;

/// Failure taxonomy for the job engine. Recovery strategy is per kind, not
/// per call site: transition rejections are expected under at-least-once
/// delivery and travel back to workers as `{updated: false}`; validation is
/// never retried; unavailability is retried by the caller.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("{0} is already in a terminal state")]
    AlreadyTerminal(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("dependency unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
