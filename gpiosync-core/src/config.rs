//! Agent configuration (`config.yaml`).
//!
//! # Storage layout
//!
//! ```text
//! ~/.gpiosync/
//!   config.yaml      (mode 0600, written by `gpiosync init`)
//!   state/           (persistent pin records, see gpiosync-engine)
//!   run/agent.sock   (daemon control socket)
//! ```
//!
//! # API pattern
//!
//! Every function that touches the filesystem has two forms:
//! - `fn_at(home: &Path, …)`: explicit home; used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::{LinkId, PinId};

pub const CONFIG_VERSION: u32 = 1;
pub const CONFIG_FILE: &str = "config.yaml";
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5_000;
/// One day. Longer intervals are rejected by `validate`.
pub const MAX_HEARTBEAT_INTERVAL_MS: u64 = 86_400_000;
pub const DEFAULT_STORAGE_NAMESPACE: &str = "storage";
pub const DEFAULT_SYSFS_ROOT: &str = "/sys/class/gpio";

// ---------------------------------------------------------------------------
// 1. Types
// ---------------------------------------------------------------------------

/// Root of `config.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub version: u32,
    pub device_id: String,
    /// Pins restored from the store and driven at boot.
    #[serde(default)]
    pub pins: Vec<PinId>,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub gpio: GpioConfig,
    #[serde(default = "LinkConfig::cloud_defaults")]
    pub cloud: LinkConfig,
    #[serde(default = "LinkConfig::local_defaults")]
    pub local: LinkConfig,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Single namespace shared by every pin record.
    pub namespace: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_STORAGE_NAMESPACE.to_string(),
        }
    }
}

/// Which pin controller the daemon constructs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GpioBackend {
    /// Linux `/sys/class/gpio` interface.
    #[default]
    Sysfs,
    /// In-memory pins; for bench setups without hardware.
    Simulated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpioConfig {
    #[serde(default)]
    pub backend: GpioBackend,
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,
    /// Pin numbers that may be driven as outputs.
    #[serde(default = "esp32_output_pins")]
    pub valid_outputs: BTreeSet<PinId>,
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            backend: GpioBackend::default(),
            sysfs_root: default_sysfs_root(),
            valid_outputs: esp32_output_pins(),
        }
    }
}

/// Broker connection settings for one link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// CA bundle (PEM). When set the link connects over TLS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<PathBuf>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

impl LinkConfig {
    pub fn cloud_defaults() -> Self {
        Self::disabled(8883)
    }

    pub fn local_defaults() -> Self {
        Self::disabled(1883)
    }

    fn disabled(port: u16) -> Self {
        Self {
            enabled: false,
            host: String::new(),
            port,
            client_id: None,
            username: None,
            password: None,
            ca_file: None,
            keep_alive_secs: default_keep_alive_secs(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }

    /// Explicit client id, or `<device-id>-<link>`.
    pub fn client_id_for(&self, device_id: &str, link: LinkId) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("{device_id}-{link}"))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl AgentConfig {
    /// A config with every optional section at its default and both links
    /// disabled.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            version: CONFIG_VERSION,
            device_id: device_id.into(),
            pins: vec![],
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            storage: StorageConfig::default(),
            gpio: GpioConfig::default(),
            cloud: LinkConfig::cloud_defaults(),
            local: LinkConfig::local_defaults(),
            created_at: Utc::now(),
        }
    }

    pub fn link(&self, link: LinkId) -> &LinkConfig {
        match link {
            LinkId::Cloud => &self.cloud,
            LinkId::Local => &self.local,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Reject configs the agent cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_id.is_empty() {
            return Err(ConfigError::Invalid("device_id must not be empty".into()));
        }
        if self.device_id.contains(&['/', '+', '#'][..]) {
            return Err(ConfigError::Invalid(format!(
                "device_id '{}' must not contain '/', '+' or '#'",
                self.device_id
            )));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat_interval_ms must be greater than zero".into(),
            ));
        }
        if self.heartbeat_interval_ms > MAX_HEARTBEAT_INTERVAL_MS {
            return Err(ConfigError::Invalid(format!(
                "heartbeat_interval_ms must be at most {MAX_HEARTBEAT_INTERVAL_MS}"
            )));
        }
        if self.storage.namespace.is_empty() {
            return Err(ConfigError::Invalid(
                "storage.namespace must not be empty".into(),
            ));
        }
        for pin in &self.pins {
            if !self.gpio.valid_outputs.contains(pin) {
                return Err(ConfigError::Invalid(format!(
                    "pin {pin} is not in gpio.valid_outputs"
                )));
            }
        }
        for link in LinkId::ALL {
            let cfg = self.link(link);
            if cfg.enabled && cfg.host.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "{link} link is enabled but has no host"
                )));
            }
        }
        Ok(())
    }
}

fn default_heartbeat_interval_ms() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_MS
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from(DEFAULT_SYSFS_ROOT)
}

fn default_keep_alive_secs() -> u64 {
    10
}

fn default_reconnect_delay_ms() -> u64 {
    2_000
}

/// ESP32 output-capable GPIO numbering: 0–33 without the SPI flash pins 6–11.
/// 34–39 are input-only.
pub fn esp32_output_pins() -> BTreeSet<PinId> {
    (0..=33u32)
        .filter(|n| !(6..=11).contains(n))
        .map(PinId)
        .collect()
}

// ---------------------------------------------------------------------------
// 2. Path helpers
// ---------------------------------------------------------------------------

/// `<home>/.gpiosync/`
pub fn agent_root_at(home: &Path) -> PathBuf {
    home.join(".gpiosync")
}

/// `<home>/.gpiosync/config.yaml`, pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    agent_root_at(home).join(CONFIG_FILE)
}

// ---------------------------------------------------------------------------
// 3. Load
// ---------------------------------------------------------------------------

/// Load and validate `<home>/.gpiosync/config.yaml`.
///
/// Returns `ConfigError::ConfigNotFound` if absent,
/// `ConfigError::Parse` (with path + line context) if malformed YAML.
pub fn load_at(home: &Path) -> Result<AgentConfig, ConfigError> {
    let path = config_path_at(home);
    if !path.exists() {
        return Err(ConfigError::ConfigNotFound { path });
    }
    let contents = std::fs::read_to_string(&path)?;
    let config: AgentConfig =
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse { path, source: e })?;
    config.validate()?;
    Ok(config)
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<AgentConfig, ConfigError> {
    load_at(&home()?)
}

// ---------------------------------------------------------------------------
// 4. Save (atomic)
// ---------------------------------------------------------------------------

/// Atomically write `config` to `<home>/.gpiosync/config.yaml`.
///
/// Write flow: serialize → `config.yaml.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_at(home: &Path, config: &AgentConfig) -> Result<(), ConfigError> {
    let root = agent_root_at(home);
    if !root.exists() {
        std::fs::create_dir_all(&root)?;
        set_dir_permissions(&root)?;
    }
    let path = config_path_at(home);
    let tmp_path = path.with_file_name(format!("{CONFIG_FILE}.tmp"));

    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(&tmp_path, yaml)?;
    set_file_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

/// `save_at` convenience wrapper.
pub fn save(config: &AgentConfig) -> Result<(), ConfigError> {
    save_at(&home()?, config)
}

// ---------------------------------------------------------------------------
// 5. Init
// ---------------------------------------------------------------------------

/// Write `config` as the agent's configuration after validating it.
///
/// Idempotent: if a config already exists, loads and returns it unchanged.
pub fn init_at(home: &Path, config: AgentConfig) -> Result<AgentConfig, ConfigError> {
    if config_path_at(home).exists() {
        return load_at(home);
    }
    config.validate()?;
    save_at(home, &config)?;
    Ok(config)
}

/// `init_at` convenience wrapper.
pub fn init(config: AgentConfig) -> Result<AgentConfig, ConfigError> {
    init_at(&home()?, config)
}

// ---------------------------------------------------------------------------
// 6. Helpers
// ---------------------------------------------------------------------------

fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
