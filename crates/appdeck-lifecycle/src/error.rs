//! Lifecycle error types.

use thiserror::Error;

use appdeck_health::HealthError;
use appdeck_state::{InstanceStatus, StateError};

/// Pre-condition failures of lifecycle operations.
///
/// Step and probe failures are not errors: they end up in lifecycle logs
/// and in the final instance status.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("template not found: {0}")]
    TemplateNotFound(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("template is disabled: {0}")]
    TemplateDisabled(String),

    #[error("cannot {action} instance {id} while it is {status}")]
    InvalidTransition {
        id: String,
        action: &'static str,
        status: InstanceStatus,
    },

    #[error("instance {0} already has a run in progress")]
    Busy(String),

    #[error("instance {0} has no run in progress")]
    NoActiveRun(String),

    #[error("run of instance {id} ended abnormally: {reason}")]
    RunAborted { id: String, reason: String },

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("health check error: {0}")]
    Health(#[from] HealthError),
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;
