//! Environment handed to the sandboxed session.
//!
//! Entries are appended in source order; a later entry for the same key
//! overrides an earlier one when the session manager loads the file.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::context::{HostRoot, SessionContext};

static VALID_ENTRY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*=").expect("static pattern"));

const USER_ENV_TEMPLATE: &str = "# This file accepts simple KEY=VAL envs";

/// Sandbox path of the generated environment file.
const ENV_FILE_IN_SANDBOX: &str = "/run/generated.env";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSet {
    entries: Vec<String>,
}

impl EnvSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry. Returns false if it is not a `KEY=VALUE` pair.
    pub fn push(&mut self, entry: impl Into<String>) -> bool {
        let entry = entry.into();
        if !VALID_ENTRY.is_match(&entry) {
            debug!("Rejecting invalid environment variable: {}", entry);
            return false;
        }
        self.entries.push(entry);
        true
    }

    pub fn set(&mut self, key: &str, value: impl AsRef<str>) -> bool {
        self.push(format!("{}={}", key, value.as_ref()))
    }

    pub fn extend<I, S>(&mut self, entries: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for entry in entries {
            self.push(entry);
        }
    }

    /// Effective value of `key`: the last entry wins.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter().rev().find_map(|e| {
            e.split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(entry);
            out.push('\n');
        }
        out
    }

    /// Replace `path` with the rendered set.
    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        fs::write(path, self.render())
    }
}

/// XDG directories redirected into the state directory.
pub fn xdg_env(ctx: &SessionContext) -> Vec<String> {
    let state = ctx.sandbox_home();
    let state = state.display();
    let mut env = vec![format!(
        "XDG_CONFIG_HOME={}",
        ctx.translate_path(&ctx.config_home).display()
    )];
    for (key, rel) in [
        ("XDG_DOCUMENTS_DIR", "Documents"),
        ("XDG_DATA_HOME", ".local/share"),
        ("XDG_STATE_HOME", ".local/state"),
        ("XDG_CACHE_HOME", "cache"),
        ("XDG_DESKTOP_DIR", "Desktop"),
        ("XDG_DOWNLOAD_DIR", "Downloads"),
        ("XDG_TEMPLATES_DIR", "Templates"),
        ("XDG_PUBLICSHARE_DIR", "Public"),
        ("XDG_MUSIC_DIR", "Music"),
        ("XDG_PICTURES_DIR", "Pictures"),
        ("XDG_VIDEOS_DIR", "Videos"),
    ] {
        env.push(format!("{key}={state}/{rel}"));
    }
    env
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputMethod {
    Fcitx,
    IBus,
    Gcin,
}

impl InputMethod {
    fn from_value(value: &str) -> Option<Self> {
        if value.contains("fcitx") {
            Some(Self::Fcitx)
        } else if value.contains("ibus") {
            Some(Self::IBus)
        } else if value.contains("gcin") {
            Some(Self::Gcin)
        } else {
            None
        }
    }

    /// (QT_IM_MODULE, GTK_IM_MODULE)
    fn modules(self) -> (&'static str, &'static str) {
        match self {
            Self::Fcitx => ("fcitx", "fcitx"),
            Self::IBus => ("ibus", "ibus"),
            Self::Gcin => ("ibus", "gcin"),
        }
    }
}

/// Guess the running input method from process names.
fn scan_processes(root: &HostRoot) -> Option<InputMethod> {
    let entries = match root.list("/proc") {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Could not determine input method via process lookup: {}", e);
            return None;
        }
    };
    entries
        .iter()
        .filter(|e| e.name.parse::<u32>().is_ok())
        .filter_map(|e| root.read_to_string(format!("/proc/{}/comm", e.name)).ok())
        .find_map(|comm| match InputMethod::from_value(&comm) {
            Some(InputMethod::Gcin) | None => None,
            found => found,
        })
}

pub fn input_method_env(ctx: &SessionContext) -> Vec<String> {
    let mut env = vec!["IBUS_USE_PORTAL=1".to_string()];
    if ctx.profile.wayland_only {
        env.push("QT_IM_MODULE=wayland".to_string());
        env.push("GTK_IM_MODULE=wayland".to_string());
        return env;
    }

    let detected = ["XMODIFIERS", "QT_IM_MODULE", "GTK_IM_MODULE"]
        .iter()
        .filter_map(|key| ctx.env.get(key))
        .find_map(InputMethod::from_value)
        .or_else(|| {
            warn!("Could not determine IM via environment variables");
            scan_processes(&ctx.root)
        });
    debug!("Determined input method type: {:?}", detected);

    if let Some(im) = detected {
        let (qt, gtk) = im.modules();
        env.push(format!("QT_IM_MODULE={qt}"));
        env.push(format!("GTK_IM_MODULE={gtk}"));
    }
    env
}

/// Toolkit switches, the sandbox home and the display and bus addresses.
pub fn misc_env(ctx: &SessionContext) -> Vec<String> {
    let mut env = Vec::new();
    if ctx.profile.use_zink {
        env.extend(
            [
                "__GLX_VENDOR_LIBRARY_NAME=mesa",
                "MESA_LOADER_DRIVER_OVERRIDE=zink",
                "GALLIUM_DRIVER=zink",
                "LIBGL_KOPPER_DRI2=1",
                "__EGL_VENDOR_LIBRARY_FILENAMES=/usr/share/glvnd/egl_vendor.d/50_mesa.json",
            ]
            .map(String::from),
        );
    }
    if ctx.profile.qt5_compat {
        env.push("QT_QPA_PLATFORMTHEME=xdgdesktopportal".to_string());
    }
    env.extend(
        [
            "GDK_DEBUG=portals",
            "GTK_USE_PORTAL=1",
            "QT_AUTO_SCREEN_SCALE_FACTOR=1",
            "QT_ENABLE_HIGHDPI_SCALING=1",
        ]
        .map(String::from),
    );
    env.push(format!("PS1=Portable·{}> ", ctx.profile.app_id));
    if let Some(scale) = ctx.env.get("QT_SCALE_FACTOR").filter(|v| !v.is_empty()) {
        env.push(format!("QT_SCALE_FACTOR={scale}"));
    }
    env.push(format!("HOME={}", ctx.sandbox_home().display()));
    if let Some(session) = ctx.env.get("XDG_SESSION_TYPE") {
        env.push(format!("XDG_SESSION_TYPE={session}"));
    }
    env.push(format!(
        "WAYLAND_DISPLAY={}",
        ctx.runtime().join("wayland-0").display()
    ));
    env.push("DBUS_SESSION_BUS_ADDRESS=unix:path=/run/sessionBus".to_string());
    env
}

/// Lines of the user's `portable.env`. With `create`, a missing file is
/// created from a comment template.
pub fn user_env(ctx: &SessionContext, create: bool) -> Vec<String> {
    let path = ctx.paths.user_env_file();
    match fs::read_to_string(&path) {
        Ok(content) => content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(String::from)
            .collect(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!("No user environment file at {}", path.display());
            if create {
                if let Err(e) = fs::write(&path, USER_ENV_TEMPLATE) {
                    warn!("Unable to create {}: {}", path.display(), e);
                }
            }
            Vec::new()
        }
        Err(e) => {
            warn!("Unable to read user environment {}: {}", path.display(), e);
            Vec::new()
        }
    }
}

/// Full environment in source order.
pub fn build_env(ctx: &SessionContext, fragment_env: Vec<String>, create_user_file: bool) -> EnvSet {
    let mut env = EnvSet::new();
    env.extend(xdg_env(ctx));
    env.extend(input_method_env(ctx));
    env.extend(misc_env(ctx));
    env.extend(fragment_env);
    env.extend(user_env(ctx, create_user_file));
    env.extend(ctx.profile.lines.iter().cloned());

    // Resolved values, including ones taken from the launcher environment.
    env.set("launchTarget", &ctx.profile.launch_target);
    if let Some(bus_target) = &ctx.profile.bus_launch_target {
        env.set("busLaunchTarget", bus_target);
    }
    env
}

/// rc file for the debug shell.
pub fn write_bashrc(ctx: &SessionContext) -> io::Result<()> {
    fs::write(ctx.paths.bashrc(), format!("source {ENV_FILE_IN_SANDBOX}\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::context_with;

    #[test]
    fn rejects_malformed_entries() {
        let mut env = EnvSet::new();
        assert!(env.push("A=1"));
        assert!(!env.push("1A=2"));
        assert!(!env.push("no equals"));
        assert!(!env.push("# comment"));
        assert!(env.push("_B="));
        assert_eq!(env.render(), "A=1\n_B=\n");
    }

    #[test]
    fn later_entries_override() {
        let mut env = EnvSet::new();
        env.extend(["GTK_IM_MODULE=ibus", "X=1", "GTK_IM_MODULE=fcitx"]);
        assert_eq!(env.get("GTK_IM_MODULE"), Some("fcitx"));
        assert_eq!(env.get("Y"), None);
    }

    #[test]
    fn xdg_dirs_point_into_state_directory() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_with("", &[], dir.path());
        let env = xdg_env(&ctx);
        assert_eq!(
            env[0],
            "XDG_CONFIG_HOME=/home/alice/.local/share/Test_Data/.config"
        );
        assert!(env.contains(
            &"XDG_CACHE_HOME=/home/alice/.local/share/Test_Data/cache".to_string()
        ));
    }

    #[test]
    fn input_method_from_environment() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_with(
            "waylandOnly=false\n",
            &[("XMODIFIERS", "@im=fcitx")],
            dir.path(),
        );
        assert_eq!(
            input_method_env(&ctx),
            ["IBUS_USE_PORTAL=1", "QT_IM_MODULE=fcitx", "GTK_IM_MODULE=fcitx"]
        );
    }

    #[test]
    fn input_method_from_process_scan() {
        let dir = tempfile::tempdir().unwrap();
        for (pid, comm) in [("1", "systemd\n"), ("42", "ibus-daemon\n")] {
            std::fs::create_dir_all(dir.path().join("proc").join(pid)).unwrap();
            std::fs::write(dir.path().join("proc").join(pid).join("comm"), comm).unwrap();
        }
        let ctx = context_with("waylandOnly=false\n", &[], dir.path());
        assert_eq!(
            input_method_env(&ctx),
            ["IBUS_USE_PORTAL=1", "QT_IM_MODULE=ibus", "GTK_IM_MODULE=ibus"]
        );
    }

    #[test]
    fn wayland_only_forces_wayland_modules() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_with(
            "waylandOnly=true\n",
            &[("GTK_IM_MODULE", "ibus")],
            dir.path(),
        );
        assert_eq!(
            input_method_env(&ctx),
            ["IBUS_USE_PORTAL=1", "QT_IM_MODULE=wayland", "GTK_IM_MODULE=wayland"]
        );
    }

    #[test]
    fn profile_lines_come_last() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context_with("QT_QPA_PLATFORMTHEME=gtk3\n", &[], dir.path());
        ctx.paths.data_home = dir.path().to_path_buf();
        std::fs::create_dir_all(ctx.sandbox_home()).unwrap();

        let env = build_env(&ctx, vec!["DRI_PRIME=1".into()], true);
        assert_eq!(env.get("QT_QPA_PLATFORMTHEME"), Some("gtk3"));
        assert_eq!(env.get("DRI_PRIME"), Some("1"));
        assert_eq!(env.get("launchTarget"), Some("/usr/bin/test-app"));
        assert_eq!(
            env.get("DBUS_SESSION_BUS_ADDRESS"),
            Some("unix:path=/run/sessionBus")
        );
        let template = std::fs::read_to_string(ctx.paths.user_env_file()).unwrap();
        assert_eq!(template, USER_ENV_TEMPLATE);
    }

    #[test]
    fn user_env_skips_comments() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context_with("", &[], dir.path());
        ctx.paths.data_home = dir.path().to_path_buf();
        std::fs::create_dir_all(ctx.sandbox_home()).unwrap();
        std::fs::write(ctx.paths.user_env_file(), "# hi\nFOO=bar\n\n").unwrap();
        assert_eq!(user_env(&ctx, false), ["FOO=bar"]);
    }
}
