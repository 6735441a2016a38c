//! Bridge error taxonomy
//!
//! Domain errors that map onto chat replies. Usage errors and policy
//! denials are reported to the operator and never take the router down;
//! `Internal` marks an invariant violation worth a bug report.

use std::path::PathBuf;

pub type BridgeResult<T> = Result<T, BridgeError>;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("A command is already running.")]
    CommandBusy,

    #[error("failed to run command: {0}")]
    ShellSpawn(String),

    #[error("Invalid name. Use letters, numbers, '-', '_' (max 32 chars).")]
    InvalidSessionName,

    #[error("Session already exists: {0}")]
    SessionExists(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session limit reached ({0}). Kill or reuse an existing session.")]
    SessionLimit(usize),

    #[error("Timed out waiting for response file {}", .0.display())]
    ResponseTimeout(PathBuf),

    #[error("Watcher disposed before response received for {0}")]
    WatcherDisposed(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}
