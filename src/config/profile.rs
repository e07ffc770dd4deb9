//! Application profile: the `key=value` file shipped with each packaged app.
//!
//! Fields fall back to individual defaults when absent or malformed. The
//! defaults differ per field and are kept exactly as packagers expect them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::context::HostEnv;
use crate::error::ProfileError;

const SYSTEM_PROFILE_ROOT: &str = "/usr/lib/portable/info";

/// How the display is exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaylandMode {
    /// Only the Wayland socket; X11 is never bound.
    Enforced,
    /// X11 sockets and authority are bound as well.
    Disabled,
    /// Wayland-only when the host session is Wayland.
    Adaptive,
}

/// Immutable description of one packaged application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppProfile {
    pub source: PathBuf,
    pub app_id: String,
    pub friendly_name: String,
    pub state_directory: String,
    pub launch_target: String,
    pub bus_launch_target: Option<String>,
    pub mpris_name: Option<String>,

    pub wayland_mode: WaylandMode,
    /// `wayland_mode` resolved against the host session type.
    pub wayland_only: bool,

    pub bind_network: bool,
    pub terminate_immediately: bool,
    pub allow_classic_notifs: bool,
    pub use_zink: bool,
    pub qt5_compat: bool,
    pub game_mode: bool,
    pub bind_cameras: bool,
    pub bind_pipewire: bool,
    pub bind_input_devices: bool,
    pub allow_inhibit: bool,
    pub allow_global_shortcuts: bool,
    pub dbus_wake: bool,
    pub mount_info: bool,

    /// Raw lines, forwarded into the sandbox environment.
    pub lines: Vec<String>,
}

impl AppProfile {
    /// Last dot-separated segment of the app id.
    pub fn short_name(&self) -> &str {
        self.app_id.rsplit('.').next().unwrap_or(&self.app_id)
    }
}

/// Find the profile named by `_portableConfig` (or the legacy `_portalConfig`).
///
/// Tried in order: the value as a path, the system profile directory, then
/// relative to `cwd`.
pub fn locate_profile(env: &HostEnv, cwd: Option<&Path>) -> Result<PathBuf, ProfileError> {
    let raw = match env.get("_portalConfig") {
        Some(legacy) => {
            warn!("Using legacy configuration variable _portalConfig");
            legacy.to_string()
        }
        None => env
            .get("_portableConfig")
            .ok_or(ProfileError::Unspecified)?
            .to_string(),
    };

    let mut candidates = vec![
        PathBuf::from(&raw),
        Path::new(SYSTEM_PROFILE_ROOT).join(&raw).join("config"),
    ];
    if let Some(cwd) = cwd {
        candidates.push(cwd.join(&raw));
    }

    for candidate in candidates {
        debug!("Trying profile {}", candidate.display());
        if candidate.is_file() {
            debug!("Using profile {}", candidate.display());
            return Ok(candidate);
        }
    }
    Err(ProfileError::NotFound(raw))
}

/// Read and parse a profile from disk.
pub fn load_profile(path: &Path, env: &HostEnv) -> Result<AppProfile, ProfileError> {
    let content = std::fs::read_to_string(path).map_err(|source| ProfileError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut profile = parse_profile(&content, env)?;
    profile.source = path.to_path_buf();
    Ok(profile)
}

/// Parse profile text.
///
/// `launchTarget` and `busLaunchTarget` fall back to same-named environment
/// variables when absent from the file.
pub fn parse_profile(content: &str, env: &HostEnv) -> Result<AppProfile, ProfileError> {
    let mut values: HashMap<&str, String> = HashMap::new();
    let mut lines = Vec::new();

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        lines.push(trimmed.to_string());
        if let Some((key, value)) = trimmed.split_once('=') {
            values.insert(key.trim(), unquote(value.trim()));
        }
    }

    let required = |key: &'static str| -> Result<String, ProfileError> {
        values
            .get(key)
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or(ProfileError::MissingField(key))
    };

    let app_id = required("appID")?;
    if !app_id.contains('.') || app_id.starts_with('.') || app_id.ends_with('.') {
        return Err(ProfileError::InvalidField {
            field: "appID",
            reason: format!("{app_id:?} is not a reverse-DNS name"),
        });
    }
    let friendly_name = required("friendlyName")?;
    let state_directory = required("stateDirectory")?;
    if state_directory.contains("..") || state_directory.starts_with('/') {
        return Err(ProfileError::InvalidField {
            field: "stateDirectory",
            reason: "must be a relative name below the data directory".to_string(),
        });
    }

    let launch_target = match required("launchTarget") {
        Ok(target) => target,
        Err(err) => match env.get("launchTarget").filter(|v| !v.is_empty()) {
            Some(target) => {
                warn!("launchTarget taken from the environment");
                target.to_string()
            }
            None => return Err(err),
        },
    };
    let bus_launch_target = values
        .get("busLaunchTarget")
        .filter(|v| !v.is_empty())
        .cloned()
        .or_else(|| {
            env.get("busLaunchTarget")
                .filter(|v| !v.is_empty())
                .map(|v| {
                    warn!("busLaunchTarget taken from the environment");
                    v.to_string()
                })
        });

    let flag_on = |key: &str| values.get(key).map(String::as_str) != Some("false");
    let flag_off = |key: &str| values.get(key).map(String::as_str) == Some("true");

    let wayland_mode = match values.get("waylandOnly").map(String::as_str) {
        Some("true") => WaylandMode::Enforced,
        Some("false") => WaylandMode::Disabled,
        _ => WaylandMode::Adaptive,
    };
    let wayland_only = match wayland_mode {
        WaylandMode::Enforced => true,
        WaylandMode::Disabled => false,
        WaylandMode::Adaptive => env.get("XDG_SESSION_TYPE") == Some("wayland"),
    };

    Ok(AppProfile {
        source: PathBuf::new(),
        mpris_name: values.get("mprisName").filter(|v| !v.is_empty()).cloned(),
        wayland_mode,
        wayland_only,
        bind_network: flag_on("bindNetwork"),
        terminate_immediately: flag_off("terminateImmediately"),
        allow_classic_notifs: flag_on("allowClassicNotifs"),
        use_zink: flag_off("useZink"),
        qt5_compat: flag_on("qt5Compat"),
        game_mode: flag_off("gameMode"),
        bind_cameras: flag_off("bindCameras"),
        bind_pipewire: flag_off("bindPipewire"),
        bind_input_devices: flag_off("bindInputDevices"),
        allow_inhibit: flag_off("allowInhibit"),
        allow_global_shortcuts: flag_off("allowGlobalShortcuts"),
        dbus_wake: flag_off("dbusWake"),
        mount_info: flag_on("mountInfo"),
        app_id,
        friendly_name,
        state_directory,
        launch_target,
        bus_launch_target,
        lines,
    })
}

/// Strip one level of matching quotes. Unbalanced input is returned as-is.
fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == last && matches!(first, b'"' | b'\'' | b'`') {
            return value[1..value.len() - 1].to_string();
        }
    }
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
appID=top.kimiblock.test
friendlyName="Test"
stateDirectory=Test_Data
launchTarget="/usr/bin/test-app --flag"
"#;

    fn env(pairs: &[(&str, &str)]) -> HostEnv {
        HostEnv::from_pairs(pairs.iter().copied())
    }

    #[test]
    fn defaults_apply_per_field() {
        let profile = parse_profile(MINIMAL, &env(&[])).unwrap();
        assert_eq!(profile.app_id, "top.kimiblock.test");
        assert_eq!(profile.friendly_name, "Test");
        assert_eq!(profile.launch_target, "/usr/bin/test-app --flag");
        assert!(profile.bind_network);
        assert!(profile.allow_classic_notifs);
        assert!(profile.qt5_compat);
        assert!(profile.mount_info);
        assert!(!profile.game_mode);
        assert!(!profile.bind_pipewire);
        assert!(!profile.terminate_immediately);
        assert!(profile.mpris_name.is_none());
        assert_eq!(profile.wayland_mode, WaylandMode::Adaptive);
    }

    #[test]
    fn malformed_flags_fall_back_to_their_own_default() {
        let text = format!("{MINIMAL}bindNetwork=maybe\ngameMode=yes\nmountInfo=\"false\"\n");
        let profile = parse_profile(&text, &env(&[])).unwrap();
        assert!(profile.bind_network, "default-on flag stays on");
        assert!(!profile.game_mode, "default-off flag stays off");
        assert!(!profile.mount_info, "quoted false is honoured");
    }

    #[test]
    fn adaptive_wayland_follows_session_type() {
        let on_wayland = parse_profile(MINIMAL, &env(&[("XDG_SESSION_TYPE", "wayland")])).unwrap();
        assert!(on_wayland.wayland_only);

        let on_x11 = parse_profile(MINIMAL, &env(&[("XDG_SESSION_TYPE", "x11")])).unwrap();
        assert!(!on_x11.wayland_only);

        let forced = format!("{MINIMAL}waylandOnly=true\n");
        let forced = parse_profile(&forced, &env(&[("XDG_SESSION_TYPE", "x11")])).unwrap();
        assert!(forced.wayland_only);
    }

    #[test]
    fn missing_required_field_is_fatal() {
        let err = parse_profile("appID=a.b\nfriendlyName=x\n", &env(&[])).unwrap_err();
        assert!(matches!(err, ProfileError::MissingField("stateDirectory")));
    }

    #[test]
    fn launch_target_falls_back_to_environment() {
        let text = "appID=a.b\nfriendlyName=x\nstateDirectory=X\n";
        let profile = parse_profile(text, &env(&[("launchTarget", "/bin/app")])).unwrap();
        assert_eq!(profile.launch_target, "/bin/app");

        let err = parse_profile(text, &env(&[])).unwrap_err();
        assert!(matches!(err, ProfileError::MissingField("launchTarget")));
    }

    #[test]
    fn app_id_needs_a_dot() {
        let err = parse_profile(
            "appID=nodots\nfriendlyName=x\nstateDirectory=X\nlaunchTarget=y\n",
            &env(&[]),
        )
        .unwrap_err();
        assert!(matches!(err, ProfileError::InvalidField { field: "appID", .. }));
    }

    #[test]
    fn short_name_is_last_segment() {
        let profile = parse_profile(MINIMAL, &env(&[])).unwrap();
        assert_eq!(profile.short_name(), "test");
    }

    #[test]
    fn locate_prefers_literal_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config");
        std::fs::write(&file, MINIMAL).unwrap();

        let env = env(&[("_portableConfig", file.to_str().unwrap())]);
        assert_eq!(locate_profile(&env, None).unwrap(), file);
    }

    #[test]
    fn locate_falls_back_to_cwd() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.conf"), MINIMAL).unwrap();

        let env = env(&[("_portableConfig", "app.conf")]);
        assert_eq!(
            locate_profile(&env, Some(dir.path())).unwrap(),
            dir.path().join("app.conf")
        );
    }

    #[test]
    fn locate_without_variable_fails() {
        assert!(matches!(
            locate_profile(&env(&[]), None),
            Err(ProfileError::Unspecified)
        ));
    }
}
