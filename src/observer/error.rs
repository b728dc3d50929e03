// ABOUTME: Error types for port observation
//
// Observation errors mean the OS socket table could not be read at all.
// They are systemic, so the caller surfaces them instead of retrying in a
// tight loop.

use thiserror::Error;

/// Errors from scanning the local socket table.
#[derive(Debug, Error)]
pub enum ObservationError {
    /// The OS refused or failed the socket table query.
    #[error("Failed to read socket table: {0}")]
    SocketTable(String),

    /// No socket table exists on this platform.
    #[error("Port observation is not supported on this platform")]
    Unsupported,

    /// The blocking scan task was cancelled or panicked.
    #[error("Scan task failed: {0}")]
    TaskFailed(String),
}

/// Result type for port observation.
pub type ObservationResult<T> = Result<T, ObservationError>;
