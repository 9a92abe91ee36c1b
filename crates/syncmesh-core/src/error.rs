//! Error types for SyncMesh

use std::time::Duration;

use thiserror::Error;

use crate::{DataType, ResourceState, SessionState, StreamId};

/// Core SyncMesh errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Message errors
    #[error("Channel count mismatch: expected {expected}, got {actual}")]
    ChannelMismatch { expected: usize, actual: usize },

    #[error("Data type mismatch: expected {expected}, got {actual}")]
    DataTypeMismatch { expected: DataType, actual: DataType },

    // Protocol errors
    #[error("Session not active (state: {0})")]
    SessionNotActive(SessionState),

    #[error("Stream already exists: {0}")]
    StreamExists(StreamId),

    #[error("Stream not found: {0}")]
    StreamNotFound(StreamId),

    #[error("No coordinator candidates")]
    NoCandidates,

    #[error("Session full: {members} of {max} nodes")]
    SessionFull { members: usize, max: usize },

    #[error("Command not supported by {worker} worker: {command}")]
    UnsupportedCommand { worker: String, command: String },

    // Lifecycle errors
    #[error("Invalid lifecycle transition: {from} -> {to}")]
    InvalidTransition { from: ResourceState, to: ResourceState },

    #[error("Resource disposed: {0}")]
    Disposed(String),

    // Transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Stream not available: {0}")]
    StreamUnavailable(String),

    // Worker errors
    #[error("Worker failed: {0}")]
    WorkerFailed(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    // Timeouts
    #[error("Timed out after {after:?}: {operation}")]
    Timeout { operation: String, after: Duration },
}

/// Coarse classification of a [`SyncError`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Protocol,
    Transport,
    Timeout,
    Lifecycle,
}

impl SyncError {
    /// Classify this error into its taxonomy group
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::InvalidConfig(_)
            | SyncError::ChannelMismatch { .. }
            | SyncError::DataTypeMismatch { .. } => ErrorKind::Configuration,
            SyncError::SessionNotActive(_)
            | SyncError::StreamExists(_)
            | SyncError::StreamNotFound(_)
            | SyncError::NoCandidates
            | SyncError::SessionFull { .. }
            | SyncError::UnsupportedCommand { .. } => ErrorKind::Protocol,
            SyncError::InvalidTransition { .. } | SyncError::Disposed(_) => ErrorKind::Lifecycle,
            SyncError::Transport(_)
            | SyncError::StreamUnavailable(_)
            | SyncError::WorkerFailed(_)
            | SyncError::ChannelClosed(_) => ErrorKind::Transport,
            SyncError::Timeout { .. } => ErrorKind::Timeout,
        }
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        SyncError::Timeout {
            operation: operation.into(),
            after,
        }
    }
}

/// Result type for SyncMesh operations
pub type SyncResult<T> = Result<T, SyncError>;
