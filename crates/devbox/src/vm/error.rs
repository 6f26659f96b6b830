//! Orchestrator error taxonomy.

use thiserror::Error;

use crate::engine::EngineError;

/// Result type for orchestrator operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Every way a control-plane operation can fail.
///
/// Nothing here is retried automatically; callers see the kind and the
/// operation context, and repeated calls keep failing until the underlying
/// condition is fixed.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("user {0} is not authorized")]
    NotAuthorized(i64),

    #[error("maintenance mode is active")]
    MaintenanceActive,

    #[error("user {0} already has a container")]
    AlreadyExists(i64),

    #[error("no container found for user {0}")]
    NotFound(i64),

    #[error("container for user {0} is not running")]
    ContainerNotRunning(i64),

    #[error("container engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("image build failed: {0}")]
    BuildFailed(String),

    #[error("{op} timed out after {seconds}s")]
    Timeout { op: &'static str, seconds: u64 },

    #[error("web terminal URL not available within {0}s")]
    TunnelTimeout(u64),

    #[error("engine operation failed: {0}")]
    Engine(EngineError),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl From<EngineError> for OrchestratorError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Unavailable(msg) => OrchestratorError::EngineUnavailable(msg),
            EngineError::BuildFailed(msg) => OrchestratorError::BuildFailed(msg),
            EngineError::Timeout { seconds } => OrchestratorError::Timeout {
                op: "engine call",
                seconds,
            },
            other => OrchestratorError::Engine(other),
        }
    }
}
