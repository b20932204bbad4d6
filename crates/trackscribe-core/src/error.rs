//! Crate error types

use thiserror::Error;

use crate::sample::SessionId;

/// Errors raised by a session store implementation
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("session already open: {0}")]
    SessionAlreadyOpen(SessionId),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Other(String),
}

/// Errors raised by a sample source or its listeners
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("source '{source_name}' failed to start: {reason}")]
    StartFailed { source_name: String, reason: String },

    #[error("source '{source_name}' failed to stop: {reason}")]
    StopFailed { source_name: String, reason: String },

    #[error("listener rejected sample: {0}")]
    Listener(String),
}

/// Errors raised by the timing engine and route handling
#[derive(Error, Debug)]
pub enum TimingError {
    #[error("route must contain at least one waypoint")]
    EmptyRoute,

    #[error("waypoint index {index} out of range for route with {count} waypoints")]
    WaypointOutOfRange { index: usize, count: usize },

    #[error("invalid waypoint on line {line}: {reason}")]
    ParseWaypoint { line: usize, reason: String },
}

/// Errors raised by a notification listener during dispatch
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("listener error: {0}")]
    Listener(String),
}

/// Top-level coordinator errors
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Timing(#[from] TimingError),

    #[error("failed to stop {failed} of {total} sub-components: {causes}")]
    StopIncomplete {
        failed: usize,
        total: usize,
        causes: String,
    },
}
