//! XDG Base Directory path resolution.
//!
//! Every directory is resolved through a fallback chain:
//! 1. Portable-specific env var (PORTABLE_CONFIG_DIR)
//! 2. XDG env var (XDG_CONFIG_HOME, XDG_DATA_HOME) via `etcetera`
//! 3. Platform default (~/.config, ~/.local/share)
//!
//! All paths are absolute. Relative paths from env vars are ignored per XDG spec.
//! The runtime directory has no fallback: sessions cannot run without it.

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::error::SessionError;

/// Resolved host directories.
///
/// Created once at startup and threaded through the session context.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Launcher config directory: config.toml lives here
    pub config_dir: PathBuf,

    /// The user's home directory on the host
    pub home: PathBuf,

    /// XDG_CONFIG_HOME of the host user
    pub config_home: PathBuf,

    /// XDG_DATA_HOME of the host user. Sandboxed homes live below it.
    pub data_home: PathBuf,

    /// XDG_RUNTIME_DIR. None if unset or relative.
    pub runtime_dir: Option<PathBuf>,
}

impl Paths {
    /// Resolve all paths using real environment variables.
    pub fn resolve() -> Result<Self> {
        Self::resolve_with_env(|key| std::env::var(key))
    }

    /// Resolve paths with a custom env var lookup (for testing).
    pub fn resolve_with_env<F>(env_fn: F) -> Result<Self>
    where
        F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
    {
        use etcetera::BaseStrategy;

        let strategy = etcetera::choose_base_strategy()
            .map_err(|e| anyhow::anyhow!("Failed to determine base directories: {}", e))?;

        let home = env_or(&env_fn, "HOME", || strategy.home_dir().to_path_buf());
        let config_home = env_or(&env_fn, "XDG_CONFIG_HOME", || strategy.config_dir());
        let data_home = env_or(&env_fn, "XDG_DATA_HOME", || strategy.data_dir());

        let config_dir = env_or(&env_fn, "PORTABLE_CONFIG_DIR", || {
            config_home.join("portable")
        });

        let runtime_dir = env_fn("XDG_RUNTIME_DIR")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .filter(|p| p.is_absolute());

        Ok(Self {
            config_dir,
            home,
            config_home,
            data_home,
            runtime_dir,
        })
    }

    /// Config file: config_dir/config.toml
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Runtime directory, failing when the session bus environment is absent.
    pub fn runtime(&self) -> std::result::Result<&Path, SessionError> {
        match self.runtime_dir {
            Some(ref dir) if dir.is_dir() => Ok(dir),
            _ => Err(SessionError::NoRuntimeDir),
        }
    }

    /// Per-application layout under the runtime and data directories.
    pub fn for_app(&self, app_id: &str, state_directory: &str) -> AppPaths {
        AppPaths {
            runtime: self
                .runtime_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from("/run/user/unknown")),
            data_home: self.data_home.clone(),
            app_id: app_id.to_string(),
            state_directory: state_directory.to_string(),
        }
    }
}

/// Paths belonging to one application's session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub runtime: PathBuf,
    pub data_home: PathBuf,
    pub app_id: String,
    pub state_directory: String,
}

impl AppPaths {
    /// Per-instance runtime state, bound to /run inside the sandbox.
    pub fn instance_dir(&self) -> PathBuf {
        self.runtime.join("portable").join(&self.app_id)
    }

    pub fn control_file(&self) -> PathBuf {
        self.instance_dir().join("control")
    }

    pub fn control_dir(&self) -> PathBuf {
        self.instance_dir().join("portable-control")
    }

    /// Launcher-side control socket. The helper sees it as /run/portable-control/daemon.
    pub fn control_socket(&self) -> PathBuf {
        self.control_dir().join("daemon")
    }

    /// Helper service socket as seen from the host.
    pub fn helper_socket(&self) -> PathBuf {
        self.control_dir().join("helper")
    }

    pub fn env_file(&self) -> PathBuf {
        self.instance_dir().join("generated.env")
    }

    pub fn flatpak_info(&self) -> PathBuf {
        self.instance_dir().join("flatpak-info")
    }

    pub fn bashrc(&self) -> PathBuf {
        self.instance_dir().join("bashrc")
    }

    pub fn bus_dir(&self) -> PathBuf {
        self.runtime.join("app").join(&self.app_id)
    }

    pub fn bus_socket(&self) -> PathBuf {
        self.bus_dir().join("bus")
    }

    /// Accessibility bus directory.
    pub fn a11y_dir(&self) -> PathBuf {
        self.runtime.join("app").join(format!("{}-a11y", self.app_id))
    }

    pub fn flatpak_root(&self) -> PathBuf {
        self.runtime.join(".flatpak")
    }

    pub fn flatpak_app_dir(&self) -> PathBuf {
        self.flatpak_root().join(&self.app_id)
    }

    /// Directory claimed by an instance id.
    pub fn instance_record_dir(&self, instance_id: &str) -> PathBuf {
        self.flatpak_root().join(instance_id)
    }

    pub fn document_dir(&self) -> PathBuf {
        self.runtime.join("doc").join("by-app").join(&self.app_id)
    }

    /// Sandboxed home: data_home/stateDirectory
    pub fn sandbox_home(&self) -> PathBuf {
        self.data_home.join(&self.state_directory)
    }

    pub fn user_env_file(&self) -> PathBuf {
        self.sandbox_home().join("portable.env")
    }

    pub fn desktop_entry(&self) -> PathBuf {
        self.data_home
            .join("applications")
            .join(format!("{}.desktop", self.app_id))
    }
}

/// Resolve an env var with fallback. Ignores empty and relative paths per XDG spec.
fn env_or<F>(env_fn: &F, var: &str, default: impl FnOnce() -> PathBuf) -> PathBuf
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    env_fn(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .filter(|p| p.is_absolute()) // XDG spec: ignore relative paths
        .unwrap_or_else(default)
}

/// Create a directory (and parents) and set its mode.
pub fn create_dir_with_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    std::fs::create_dir_all(path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    }

    Ok(())
}
