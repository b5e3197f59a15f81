use appdeck_state::StateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("template not found: {0}")]
    TemplateNotFound(String),

    #[error("invalid health check config for port {port_id}: {reason}")]
    InvalidConfig { port_id: String, reason: String },

    #[error(transparent)]
    State(#[from] StateError),
}
