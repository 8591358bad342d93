use std::path::PathBuf;

/// Errors from supervisor operations.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Executable '{program}' not found (searched {} locations)", searched.len())]
    ExecutableNotFound {
        program: String,
        searched: Vec<PathBuf>,
    },

    #[error("Failed to spawn subprocess: {reason}")]
    SpawnFailure { reason: String },

    #[error("Previous instance of session {session_id} (pid {pid}) did not exit in time")]
    PreviousInstanceStillRunning { session_id: String, pid: u32 },

    #[error("Session not running: {session_id}")]
    SessionNotRunning { session_id: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
