use thiserror::Error;

use crate::pty::PtyError;

/// Errors returned by the session/job core.
///
/// A job that exits non-zero, times out or is cancelled is *not* an error:
/// that outcome is recorded in the job's terminal status instead.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Unknown session or job id.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A configured ceiling (sessions, subscribers) has been reached.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The shell process could not be started.
    #[error("failed to spawn shell: {0}")]
    SpawnFailed(#[source] PtyError),

    /// Append attempted after the buffer was closed.
    #[error("output buffer is closed")]
    BufferClosed,

    /// The operation is not valid in the target's current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The submitted command cannot be handed to the shell.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// A caller-supplied value (session id, limit) is malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl CoreError {
    pub fn session_not_found(id: impl Into<String>) -> Self {
        CoreError::NotFound {
            kind: "session",
            id: id.into(),
        }
    }

    pub fn job_not_found(id: impl ToString) -> Self {
        CoreError::NotFound {
            kind: "job",
            id: id.to_string(),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
