// ABOUTME: Error types for tunnel client supervision

use thiserror::Error;

/// Errors from locating, launching or controlling the tunnel client
#[derive(Error, Debug)]
pub enum LaunchError {
    /// No client executable was found
    #[error("NotInstalled")]
    NotInstalled,

    /// Process spawn failed
    #[error("Failed to spawn tunnel client: {0}")]
    SpawnFailed(#[source] std::io::Error),

    /// Process exited during the start grace period
    #[error("Tunnel client exited during startup (exit code {code:?})")]
    ExitedEarly {
        /// Exit code, if the process exited normally
        code: Option<i32>,
    },

    /// Reload signal could not be delivered and the fallback restart failed
    #[error("Failed to reload tunnel client: {0}")]
    ReloadFailed(String),

    /// Restart budget exhausted inside the restart window
    #[error("CrashLoop: tunnel client crashed {attempts} times, giving up")]
    CrashLoop {
        /// Restart attempts made inside the window
        attempts: u32,
    },

    /// Termination failed
    #[error("Failed to terminate tunnel client: {0}")]
    TerminateFailed(#[source] std::io::Error),
}

impl LaunchError {
    /// Whether this failure affects every mapping rather than a single apply
    pub const fn is_systemic(&self) -> bool {
        matches!(self, Self::NotInstalled | Self::CrashLoop { .. })
    }
}
