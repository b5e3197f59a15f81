//! Executor error types.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by a [`crate::CommandBackend`].
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn process: {0}")]
    Spawn(String),

    #[error("process I/O error: {0}")]
    Io(String),

    #[error("timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
}

/// Errors compiling a placeholder pattern.
#[derive(Debug, Error)]
pub enum PatternError {
    #[error("placeholder pattern {0:?} lacks the PARAM_NAME marker")]
    MissingMarker(String),

    #[error("placeholder pattern {0:?} has no delimiters around PARAM_NAME")]
    NoDelimiters(String),

    #[error("invalid placeholder pattern: {0}")]
    Regex(#[from] regex::Error),
}
