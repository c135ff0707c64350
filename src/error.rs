use thiserror::Error;

/// Errors returned to callers of the `Runtime` API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// The instance does not exist or has already reached a terminal state.
    #[error("instance not found: {0}")]
    UnknownInstance(String),
    #[error("instance already exists: {0}")]
    InstanceAlreadyExists(String),
    #[error("orchestration not registered: {0}")]
    UnknownOrchestration(String),
    /// The history store rejected or failed an operation.
    #[error("history store error: {0}")]
    Store(String),
    #[error("codec error: {0}")]
    Codec(String),
}
