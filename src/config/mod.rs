// ABOUTME: Configuration management for portmapper
// Handles scan, server, tunnel-client and mapping settings plus on-disk locations

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod server;

pub use server::{AuthMethod, ServerConfig};

/// Lower bound for the scan interval, in seconds
pub const MIN_SCAN_INTERVAL_SECS: u64 = 5;
/// Upper bound for the scan interval, in seconds
pub const MAX_SCAN_INTERVAL_SECS: u64 = 300;

/// Contents of `config.toml`. Every section is optional and falls back to
/// its defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Port scanning behaviour
    #[serde(default)]
    pub scan: ScanSettings,

    /// Tunnel server connection
    #[serde(default)]
    pub server: ServerConfig,

    /// Tunnel client executable and supervision
    #[serde(default)]
    pub client: ClientSettings,

    /// Mapping persistence
    #[serde(default)]
    pub mappings: MappingSettings,
}

/// `[scan]`: how often and how widely the port table is read
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSettings {
    /// Seconds between port scans (clamped to 5..=300)
    #[serde(default = "default_scan_interval")]
    pub interval_secs: u64,

    /// Whether to report ports below 1024
    #[serde(default)]
    pub show_system_ports: bool,

    /// Cap on how far the interval stretches after repeated scan failures
    #[serde(default = "default_max_backoff_factor")]
    pub max_backoff_factor: u32,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_scan_interval(),
            show_system_ports: false,
            max_backoff_factor: default_max_backoff_factor(),
        }
    }
}

impl ScanSettings {
    /// Scan interval, clamped to the supported range
    pub fn interval(&self) -> Duration {
        Duration::from_secs(
            self.interval_secs
                .clamp(MIN_SCAN_INTERVAL_SECS, MAX_SCAN_INTERVAL_SECS),
        )
    }
}

/// `[client]`: where frpc lives and how its restarts are paced.
///
/// Durations are stored under unit-suffixed keys (`restart_window_secs`,
/// `backoff_base_ms`, `backoff_max_ms`, `start_grace_ms`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Explicit path to the tunnel client, skipping the search
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<PathBuf>,

    /// Extra directories searched after the built-in install locations
    #[serde(default)]
    pub extra_search_dirs: Vec<PathBuf>,

    /// Restart attempts allowed inside one restart window
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Window over which restarts are counted
    #[serde(
        rename = "restart_window_secs",
        default = "default_restart_window",
        with = "duration_secs"
    )]
    pub restart_window: Duration,

    /// First restart delay (exponential backoff base)
    #[serde(
        rename = "backoff_base_ms",
        default = "default_backoff_base",
        with = "duration_millis"
    )]
    pub backoff_base: Duration,

    /// Maximum restart delay
    #[serde(
        rename = "backoff_max_ms",
        default = "default_backoff_max",
        with = "duration_millis"
    )]
    pub backoff_max: Duration,

    /// How long a fresh process must survive to count as started
    #[serde(
        rename = "start_grace_ms",
        default = "default_start_grace",
        with = "duration_millis"
    )]
    pub start_grace: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            executable: None,
            extra_search_dirs: Vec::new(),
            max_restarts: default_max_restarts(),
            restart_window: default_restart_window(),
            backoff_base: default_backoff_base(),
            backoff_max: default_backoff_max(),
            start_grace: default_start_grace(),
        }
    }
}

/// `[mappings]`: persistence of requested mappings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingSettings {
    /// Re-request persisted mappings on startup
    #[serde(default = "default_true")]
    pub restore_on_startup: bool,
}

impl Default for MappingSettings {
    fn default() -> Self {
        Self {
            restore_on_startup: true,
        }
    }
}

fn default_scan_interval() -> u64 {
    30
}

fn default_max_backoff_factor() -> u32 {
    8
}

fn default_max_restarts() -> u32 {
    3
}

fn default_restart_window() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_base() -> Duration {
    Duration::from_secs(1)
}

fn default_backoff_max() -> Duration {
    Duration::from_secs(30)
}

fn default_start_grace() -> Duration {
    Duration::from_millis(500)
}

fn default_true() -> bool {
    true
}

/// On-disk locations used by portmapper
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    base_dir: PathBuf,
}

impl Paths {
    /// Paths rooted at `~/.portmapper`
    pub fn user() -> Result<Self> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(Self::with_base(home.join(".portmapper")))
    }

    /// Paths rooted at an arbitrary directory
    pub fn with_base(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Base directory
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Application settings file
    pub fn config_file(&self) -> PathBuf {
        self.base_dir.join("config.toml")
    }

    /// Rendered tunnel-client configuration
    pub fn client_config(&self) -> PathBuf {
        self.base_dir.join("frpc.toml")
    }

    /// Persisted desired mappings
    pub fn mappings_file(&self) -> PathBuf {
        self.base_dir.join("mappings.json")
    }

    /// Log directory
    pub fn log_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }
}

impl AppConfig {
    /// Load configuration from the user config file, or defaults if absent
    pub fn load(paths: &Paths) -> Result<Self> {
        Self::load_from(&paths.config_file())
    }

    /// Load configuration from a specific file, or defaults if absent
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        Ok(config)
    }

    /// Save configuration to the user config file
    pub fn save(&self, paths: &Paths) -> Result<()> {
        fs::create_dir_all(paths.base_dir())?;

        let content = toml::to_string_pretty(self)?;
        crate::fsutil::write_atomic(&paths.config_file(), content.as_bytes())
            .with_context(|| format!("Failed to write {}", paths.config_file().display()))?;

        Ok(())
    }
}

/// Serde helper for Duration as seconds (u64)
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serde helper for Duration as milliseconds (u64)
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
