//! Error types for the appdeck state store.

use thiserror::Error;

use crate::types::InstanceStatus;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("template {0} is referenced by instances and cannot be changed")]
    Immutable(String),

    #[error("node {id} still has {instances} instance(s)")]
    NodeInUse { id: String, instances: usize },

    #[error("instance {id} is {actual}")]
    UnexpectedStatus { id: String, actual: InstanceStatus },

    #[error("invalid record: {0}")]
    Invalid(String),
}
