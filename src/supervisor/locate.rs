// ABOUTME: Locates the frpc executable and queries its version
//
// Search order: explicit override, working directory, PATH, well-known install
// directories, then any extra directories from the config.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::ClientSettings;

/// File name of the tunnel client
#[cfg(windows)]
pub const CLIENT_BINARY: &str = "frpc.exe";
/// File name of the tunnel client
#[cfg(not(windows))]
pub const CLIENT_BINARY: &str = "frpc";

/// How long `frpc -v` may take
pub const VERSION_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Whether the tunnel client can be run, and from where
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClientAvailability {
    /// An executable was found
    pub installed: bool,
    /// Where it was found
    pub executable_path: Option<PathBuf>,
    /// Output of `frpc -v`, when the query succeeded
    pub version: Option<String>,
}

impl ClientAvailability {
    /// No executable anywhere
    pub const fn missing() -> Self {
        Self {
            installed: false,
            executable_path: None,
            version: None,
        }
    }

    /// Executable at `path`, version unknown
    pub const fn found(path: PathBuf) -> Self {
        Self {
            installed: true,
            executable_path: Some(path),
            version: None,
        }
    }
}

/// Directories frpc is commonly installed into
pub fn well_known_dirs() -> Vec<PathBuf> {
    let mut dirs_list = Vec::new();
    if cfg!(windows) {
        dirs_list.push(PathBuf::from(r"C:\frp"));
        dirs_list.push(PathBuf::from(r"C:\Program Files\frp"));
    } else {
        dirs_list.push(PathBuf::from("/usr/local/bin"));
        dirs_list.push(PathBuf::from("/usr/bin"));
        if let Some(home) = dirs::home_dir() {
            dirs_list.push(home.join(".local").join("bin"));
        }
        dirs_list.push(PathBuf::from("/opt/frp"));
    }
    dirs_list
}

fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

/// First candidate that is an executable file
pub fn first_executable<I>(candidates: I) -> Option<PathBuf>
where
    I: IntoIterator<Item = PathBuf>,
{
    candidates.into_iter().find(|candidate| {
        let ok = is_executable(candidate);
        debug!(candidate = %candidate.display(), found = ok, "Checked frpc candidate");
        ok
    })
}

/// Find the tunnel client executable.
pub fn locate_client(settings: &ClientSettings, cwd: &Path) -> Option<PathBuf> {
    if let Some(explicit) = &settings.executable {
        if is_executable(explicit) {
            return Some(explicit.clone());
        }
        warn!(path = %explicit.display(), "Configured frpc path is not executable, searching");
    }

    if let Some(found) = first_executable([cwd.join(CLIENT_BINARY)]) {
        return Some(found);
    }

    if let Ok(found) = which::which(CLIENT_BINARY) {
        return Some(found);
    }

    first_executable(
        well_known_dirs()
            .into_iter()
            .chain(settings.extra_search_dirs.iter().cloned())
            .map(|dir| dir.join(CLIENT_BINARY)),
    )
}

/// Run `<exe> -v` and return its trimmed output
pub async fn query_version(executable: &Path, timeout: Duration) -> Option<String> {
    let output = Command::new(executable)
        .arg("-v")
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(timeout, output).await {
        Ok(Ok(output)) if output.status.success() => {
            let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
            (!version.is_empty()).then_some(version)
        }
        Ok(Ok(output)) => {
            warn!(status = ?output.status.code(), "frpc version query failed");
            None
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Could not run frpc version query");
            None
        }
        Err(_) => {
            warn!(timeout_secs = timeout.as_secs(), "frpc version query timed out");
            None
        }
    }
}

/// Locate the client and query its version
pub async fn check_availability(settings: &ClientSettings, cwd: &Path) -> ClientAvailability {
    let Some(path) = locate_client(settings, cwd) else {
        info!("frpc not found");
        return ClientAvailability::missing();
    };

    let version = query_version(&path, VERSION_QUERY_TIMEOUT).await;
    info!(path = %path.display(), version = ?version, "frpc located");
    ClientAvailability {
        installed: true,
        executable_path: Some(path),
        version,
    }
}
