mod profile;

pub use profile::{AppProfile, WaylandMode, load_profile, locate_profile, parse_profile};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::paths::Paths;

/// Launcher configuration read from `config.toml`.
///
/// Every field has a default, so a missing file or a partial file is fine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resolved XDG-compliant paths (not serialized)
    #[serde(skip)]
    pub paths: Option<Paths>,

    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Locations of the external programs the launcher drives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_bwrap")]
    pub bwrap: String,

    #[serde(default = "default_systemd_run")]
    pub systemd_run: String,

    #[serde(default = "default_systemctl")]
    pub systemctl: String,

    #[serde(default = "default_udevadm")]
    pub udevadm: String,

    #[serde(default = "default_dbus_proxy")]
    pub dbus_proxy: String,

    #[serde(default = "default_pw_container")]
    pub pw_container: String,

    #[serde(default = "default_dbus_send")]
    pub dbus_send: String,

    /// Helper executable as seen inside the sandbox
    #[serde(default = "default_helper")]
    pub helper: String,

    /// Template used to render the flatpak-info compatibility record
    #[serde(default = "default_flatpak_info_template")]
    pub flatpak_info_template: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Candidate instance ids drawn before giving up
    #[serde(default = "default_instance_id_attempts")]
    pub instance_id_attempts: usize,

    /// How long to wait for the bus proxy socket to appear
    #[serde(default = "default_proxy_socket_timeout")]
    pub proxy_socket_timeout_ms: u64,

    /// How long to wait for pw-container to announce its socket
    #[serde(default = "default_pipewire_timeout")]
    pub pipewire_timeout_ms: u64,

    /// Poll interval for bounded waits
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// debug | info | warn
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_bwrap() -> String {
    "bwrap".to_string()
}
fn default_systemd_run() -> String {
    "systemd-run".to_string()
}
fn default_systemctl() -> String {
    "systemctl".to_string()
}
fn default_udevadm() -> String {
    "/usr/bin/udevadm".to_string()
}
fn default_dbus_proxy() -> String {
    "/usr/bin/xdg-dbus-proxy".to_string()
}
fn default_pw_container() -> String {
    "/usr/bin/pw-container".to_string()
}
fn default_dbus_send() -> String {
    "dbus-send".to_string()
}
fn default_helper() -> String {
    "/usr/lib/portable/helper".to_string()
}
fn default_flatpak_info_template() -> PathBuf {
    PathBuf::from("/usr/lib/portable/flatpak-info")
}
fn default_instance_id_attempts() -> usize {
    64
}
fn default_proxy_socket_timeout() -> u64 {
    5000
}
fn default_pipewire_timeout() -> u64 {
    5000
}
fn default_retry_interval() -> u64 {
    100
}
fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            bwrap: default_bwrap(),
            systemd_run: default_systemd_run(),
            systemctl: default_systemctl(),
            udevadm: default_udevadm(),
            dbus_proxy: default_dbus_proxy(),
            pw_container: default_pw_container(),
            dbus_send: default_dbus_send(),
            helper: default_helper(),
            flatpak_info_template: default_flatpak_info_template(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            instance_id_attempts: default_instance_id_attempts(),
            proxy_socket_timeout_ms: default_proxy_socket_timeout(),
            pipewire_timeout_ms: default_pipewire_timeout(),
            retry_interval_ms: default_retry_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl SessionConfig {
    pub fn proxy_socket_timeout(&self) -> Duration {
        Duration::from_millis(self.proxy_socket_timeout_ms)
    }

    pub fn pipewire_timeout(&self) -> Duration {
        Duration::from_millis(self.pipewire_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms.max(1))
    }
}

impl Config {
    /// Load from the resolved config directory, or from an explicit path.
    pub fn load(explicit: Option<&str>) -> Result<Self> {
        let paths = Paths::resolve()?;
        let path = match explicit {
            Some(p) => PathBuf::from(shellexpand::tilde(p).to_string()),
            None => paths.config_file(),
        };

        let mut config = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str::<Config>(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            Config::default()
        };
        config.paths = Some(paths);
        Ok(config)
    }

    pub fn paths(&self) -> Result<Paths> {
        match self.paths {
            Some(ref p) => Ok(p.clone()),
            None => Paths::resolve(),
        }
    }
}
