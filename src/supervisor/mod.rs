// ABOUTME: Tunnel client supervision with bounded crash restarts
//
// `ClientSupervisor` owns one `ClientProcess` and tracks its lifecycle. It
// never restarts on its own: the reconciler polls health, asks for a restart
// to be scheduled, and performs it when the deadline passes. After the
// restart budget for the window is spent the supervisor stays `Failed` until
// it is explicitly reset.

pub mod backoff;
pub mod error;
pub mod locate;
pub mod process;

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use backoff::RestartPolicy;
pub use error::LaunchError;
pub use locate::ClientAvailability;
pub use process::{ClientProcess, FrpcProcess};

use crate::config::ClientSettings;

/// Lifecycle state of the tunnel client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    /// Availability not checked yet
    Unknown,
    /// No executable found
    NotInstalled,
    /// Installed but not running
    Stopped,
    /// Start in progress
    Starting,
    /// Running with the last applied configuration
    Running,
    /// Exited unexpectedly; a restart may be scheduled
    Crashed,
    /// Restart budget exhausted
    Failed,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::NotInstalled => "not installed",
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Crashed => "crashed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Drives a `ClientProcess` through start, reload, stop and crash restarts
pub struct ClientSupervisor<P> {
    process: P,
    state: ClientState,
    policy: RestartPolicy,
    restart_at: Option<Instant>,
}

impl<P: ClientProcess> ClientSupervisor<P> {
    /// Wrap `process` using the restart limits from `settings`
    pub const fn new(process: P, settings: &ClientSettings) -> Self {
        Self {
            process,
            state: ClientState::Unknown,
            policy: RestartPolicy::from_settings(settings),
            restart_at: None,
        }
    }

    /// Current state
    pub const fn state(&self) -> ClientState {
        self.state
    }

    /// Access the underlying process
    pub const fn process(&self) -> &P {
        &self.process
    }

    /// Restart attempts allowed per window
    pub const fn max_restarts(&self) -> u32 {
        self.policy.max_restarts()
    }

    /// Locate the executable and update the state to match
    pub async fn locate(&mut self) -> ClientAvailability {
        let availability = self.process.locate().await;
        self.state = if availability.installed {
            match self.state {
                ClientState::Unknown | ClientState::NotInstalled => ClientState::Stopped,
                other => other,
            }
        } else {
            ClientState::NotInstalled
        };
        availability
    }

    /// Whether the process is alive right now
    pub fn is_running(&mut self) -> bool {
        self.process.is_running()
    }

    /// Start the client, or reload it if it is running and `changed` is set.
    pub async fn ensure_running(
        &mut self,
        config_path: &Path,
        changed: bool,
    ) -> Result<(), LaunchError> {
        match self.state {
            ClientState::NotInstalled => return Err(LaunchError::NotInstalled),
            ClientState::Failed => {
                return Err(LaunchError::CrashLoop {
                    attempts: self.policy.max_restarts(),
                })
            }
            _ => {}
        }

        if self.process.is_running() {
            if changed {
                if let Err(e) = self.process.reload(config_path).await {
                    self.after_failure(&e, true);
                    return Err(e);
                }
                info!("Tunnel client reloaded");
            }
            self.state = ClientState::Running;
            return Ok(());
        }

        // Running or Crashed here means the client died since we last looked
        let was_live = matches!(self.state, ClientState::Running | ClientState::Crashed);
        if was_live {
            warn!(state = %self.state, "Tunnel client not running, relaunching");
        }
        self.launch(config_path, was_live).await
    }

    async fn launch(&mut self, config_path: &Path, was_live: bool) -> Result<(), LaunchError> {
        self.state = ClientState::Starting;
        self.restart_at = None;

        match self.process.start(config_path).await {
            Ok(pid) => {
                info!(pid, "Tunnel client running");
                self.state = ClientState::Running;
                Ok(())
            }
            Err(e) => {
                self.after_failure(&e, was_live);
                Err(e)
            }
        }
    }

    /// Settle the state after a failed start or reload. A client that was
    /// serving mappings and is now gone counts as crashed, so the caller can
    /// schedule a restart.
    fn after_failure(&mut self, error: &LaunchError, was_live: bool) {
        self.state = match error {
            LaunchError::NotInstalled => ClientState::NotInstalled,
            _ if self.process.is_running() => ClientState::Running,
            _ if was_live => ClientState::Crashed,
            _ => ClientState::Stopped,
        };
        warn!(error = %error, state = %self.state, "Tunnel client operation failed");
    }

    /// Detect an unexpected exit. Returns true when the client just crashed.
    pub fn poll_health(&mut self) -> bool {
        if self.state != ClientState::Running || self.process.is_running() {
            return false;
        }
        warn!("Tunnel client exited unexpectedly");
        self.state = ClientState::Crashed;
        true
    }

    /// Schedule a restart after a crash.
    ///
    /// Returns the delay until the restart, or `CrashLoop` once the window's
    /// budget is used up, after which the state is `Failed`.
    pub fn schedule_restart(&mut self, now: Instant) -> Result<Duration, LaunchError> {
        match self.policy.record_attempt(now) {
            Ok(attempt) => {
                let delay = self.policy.delay_for(attempt);
                self.restart_at = Some(now + delay);
                self.state = ClientState::Crashed;
                info!(
                    attempt,
                    max = self.policy.max_restarts(),
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Scheduled tunnel client restart"
                );
                Ok(delay)
            }
            Err(e) => {
                self.restart_at = None;
                self.state = ClientState::Failed;
                warn!(error = %e, "Tunnel client restart budget exhausted");
                Err(e)
            }
        }
    }

    /// When the scheduled restart is due
    pub const fn restart_deadline(&self) -> Option<Instant> {
        self.restart_at
    }

    /// Whether a scheduled restart is due at `now`
    pub fn restart_due(&self, now: Instant) -> bool {
        self.restart_at.is_some_and(|at| at <= now)
    }

    /// Perform the scheduled restart
    pub async fn restart(&mut self, config_path: &Path) -> Result<(), LaunchError> {
        debug!("Restarting tunnel client");
        self.launch(config_path, true).await
    }

    /// Drop any scheduled restart
    pub fn cancel_restart(&mut self) {
        if self.restart_at.take().is_some() {
            debug!("Cancelled scheduled tunnel client restart");
        }
    }

    /// Stop the client and cancel any pending restart
    pub async fn stop(&mut self) -> Result<(), LaunchError> {
        self.cancel_restart();
        let result = self.process.stop().await;
        if self.state != ClientState::NotInstalled {
            self.state = ClientState::Stopped;
        }
        result
    }

    /// Clear the crash history so a failed client may be started again
    pub fn reset(&mut self) {
        self.policy.clear();
        self.restart_at = None;
        if matches!(self.state, ClientState::Failed | ClientState::Crashed) {
            info!("Tunnel client supervisor reset");
            self.state = ClientState::Stopped;
        }
    }
}
