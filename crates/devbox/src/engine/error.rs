//! Engine client error types.

use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the container engine adapter.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine endpoint could not be reached at all (binary missing,
    /// daemon down). Never retried automatically; the operator has to fix
    /// connectivity.
    #[error("container engine unavailable: {0}")]
    Unavailable(String),

    /// The engine command ran but reported failure.
    #[error("engine {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Container was not found.
    #[error("container not found: {0}")]
    NotFound(String),

    /// Image build or pull failed.
    #[error("image build failed: {0}")]
    BuildFailed(String),

    /// The operation exceeded its deadline.
    #[error("engine operation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// Failed to parse engine output.
    #[error("failed to parse engine output: {0}")]
    ParseError(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Patterns in engine stderr that indicate the daemon itself is unreachable
/// rather than the individual command failing.
const UNAVAILABLE_MARKERS: &[&str] = &[
    "Cannot connect to the Docker daemon",
    "connection refused",
    "error connecting to podman",
    "dial unix",
];

impl EngineError {
    /// Classify a failed command: daemon-unreachable stderr becomes
    /// `Unavailable`, everything else stays `CommandFailed`.
    pub fn from_command(command: &str, stderr: &str) -> Self {
        if UNAVAILABLE_MARKERS.iter().any(|m| stderr.contains(m)) {
            EngineError::Unavailable(stderr.trim().to_string())
        } else {
            EngineError::CommandFailed {
                command: command.to_string(),
                message: stderr.trim().to_string(),
            }
        }
    }
}
