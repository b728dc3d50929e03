// ABOUTME: The tunnel client process capability and its frpc implementation
//
// `ClientProcess` is the seam the supervisor drives: find the executable,
// start it with a config file, reload it after a config change, stop it, and
// poll whether it is still alive. `FrpcProcess` does this with a real child
// process; tests substitute a fake.

#![allow(clippy::option_if_let_else)]

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use super::error::LaunchError;
use super::locate::{self, ClientAvailability};
use crate::config::ClientSettings;

/// Control surface of the external tunnel client
pub trait ClientProcess: Send {
    /// Find the executable and report whether it can be run
    fn locate(&mut self) -> impl Future<Output = ClientAvailability> + Send;

    /// Start the client with `config_path`, returning its PID once it has
    /// survived the start grace period
    fn start(&mut self, config_path: &Path) -> impl Future<Output = Result<u32, LaunchError>> + Send;

    /// Make a running client pick up a changed `config_path`
    fn reload(&mut self, config_path: &Path) -> impl Future<Output = Result<(), LaunchError>> + Send;

    /// Stop the client; stopping a client that is not running is not an error
    fn stop(&mut self) -> impl Future<Output = Result<(), LaunchError>> + Send;

    /// Poll whether the client is alive
    fn is_running(&mut self) -> bool;
}

/// A real frpc child process
pub struct FrpcProcess {
    settings: ClientSettings,
    cwd: PathBuf,
    executable: Option<PathBuf>,
    child: Option<Child>,
}

impl FrpcProcess {
    /// Grace period for SIGTERM before SIGKILL
    const TERMINATE_TIMEOUT: Duration = Duration::from_secs(2);

    /// Create a handle that searches for frpc relative to `cwd`
    pub fn new(settings: ClientSettings, cwd: PathBuf) -> Self {
        Self {
            settings,
            cwd,
            executable: None,
            child: None,
        }
    }

    /// Use a known executable, skipping the search
    pub fn with_executable(settings: ClientSettings, executable: PathBuf) -> Self {
        let cwd = executable
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        Self {
            settings,
            cwd,
            executable: Some(executable),
            child: None,
        }
    }

    /// PID of the running child, if any
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    fn forward_output(child: &mut Child) {
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "portmapper::frpc", "{line}");
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(target: "portmapper::frpc", "{line}");
                }
            });
        }
    }

    async fn spawn(&mut self, config_path: &Path) -> Result<u32, LaunchError> {
        let executable = self.executable.clone().ok_or(LaunchError::NotInstalled)?;

        debug!(executable = %executable.display(), config = %config_path.display(), "Spawning frpc");

        let mut child = Command::new(&executable)
            .arg("-c")
            .arg(config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    LaunchError::NotInstalled
                } else {
                    LaunchError::SpawnFailed(e)
                }
            })?;

        Self::forward_output(&mut child);
        let pid = child.id().unwrap_or(0);

        // A process that dies inside the grace period never really started
        match tokio::time::timeout(self.settings.start_grace, child.wait()).await {
            Ok(Ok(status)) => {
                warn!(pid, code = ?status.code(), "frpc exited during startup");
                return Err(LaunchError::ExitedEarly {
                    code: status.code(),
                });
            }
            Ok(Err(e)) => {
                error!(pid, error = %e, "Failed waiting on frpc");
                return Err(LaunchError::SpawnFailed(e));
            }
            Err(_) => {}
        }

        info!(pid, "frpc started");
        self.child = Some(child);
        Ok(pid)
    }

    #[cfg(unix)]
    fn send_reload_signal(&self) -> Result<(), String> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let pid = self.pid().ok_or_else(|| "no pid".to_string())?;
        let raw = i32::try_from(pid).map_err(|e| e.to_string())?;
        kill(Pid::from_raw(raw), Signal::SIGHUP).map_err(|e| e.to_string())
    }

    #[cfg(not(unix))]
    fn send_reload_signal(&self) -> Result<(), String> {
        Err("reload signal unsupported on this platform".to_string())
    }

    async fn terminate(&mut self) -> Result<(), LaunchError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        let pid = child.id().unwrap_or(0);
        info!(pid, "Terminating frpc");

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Ok(raw) = i32::try_from(pid) {
                if raw > 0 {
                    let _ = kill(Pid::from_raw(raw), Signal::SIGTERM);
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }

        match tokio::time::timeout(Self::TERMINATE_TIMEOUT, child.wait()).await {
            Ok(Ok(_status)) => {
                debug!(pid, "frpc terminated gracefully");
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Error waiting for frpc");
            }
            Err(_) => {
                warn!(pid, "frpc did not terminate gracefully, sending SIGKILL");
                if let Err(e) = child.kill().await {
                    error!(error = %e, "Failed to kill frpc");
                    return Err(LaunchError::TerminateFailed(e));
                }
            }
        }

        Ok(())
    }
}

impl ClientProcess for FrpcProcess {
    async fn locate(&mut self) -> ClientAvailability {
        let availability = locate::check_availability(&self.settings, &self.cwd).await;
        self.executable.clone_from(&availability.executable_path);
        availability
    }

    async fn start(&mut self, config_path: &Path) -> Result<u32, LaunchError> {
        if self.is_running() {
            if let Some(pid) = self.pid() {
                debug!(pid, "frpc already running");
                return Ok(pid);
            }
        }
        self.spawn(config_path).await
    }

    async fn reload(&mut self, config_path: &Path) -> Result<(), LaunchError> {
        if !self.is_running() {
            return self.spawn(config_path).await.map(|_| ());
        }

        match self.send_reload_signal() {
            Ok(()) => {
                info!(pid = ?self.pid(), "Sent reload signal to frpc");
                Ok(())
            }
            Err(reason) => {
                warn!(reason = %reason, "Reload signal failed, restarting frpc");
                self.terminate().await?;
                self.spawn(config_path)
                    .await
                    .map(|_| ())
                    .map_err(|e| LaunchError::ReloadFailed(e.to_string()))
            }
        }
    }

    async fn stop(&mut self) -> Result<(), LaunchError> {
        self.terminate().await
    }

    fn is_running(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };

        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                warn!(code = ?status.code(), "frpc exited");
                self.child = None;
                false
            }
            Err(e) => {
                error!(error = %e, "Failed to check frpc status");
                self.child = None;
                false
            }
        }
    }
}
