use std::time::Duration;

use thiserror::Error;

/// Errors from running an external command.
#[derive(Error, Debug)]
pub enum ExecError {
    /// The process could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The process did not finish in time and was killed.
    #[error("{program} timed out after {after:?}")]
    Timeout { program: String, after: Duration },

    /// Reading the process output or waiting on it failed.
    #[error("I/O error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors surfaced by session administration and terminal attachment.
#[derive(Error, Debug)]
pub enum SessionError {
    /// tmux refused to create the session; carries its stderr.
    #[error("session creation failed: {0}")]
    SessionCreationFailed(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// A client-supplied id that does not follow the session naming rules.
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    /// The pseudo-terminal process could not start.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// Read or write failure on the PTY or the connection mid-stream.
    #[error("stream I/O error: {0}")]
    StreamIo(#[from] std::io::Error),

    #[error(transparent)]
    Exec(#[from] ExecError),
}

impl SessionError {
    /// Whether the underlying failure was a command timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, SessionError::Exec(ExecError::Timeout { .. }))
    }
}
