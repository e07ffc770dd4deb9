//! Session context threaded through every component.
//!
//! Host environment variables and the host filesystem root are captured here
//! once, so producers never consult process-global state directly.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use crate::config::{AppProfile, Config, SessionConfig, ToolsConfig};
use crate::paths::{AppPaths, Paths};

/// Snapshot of the host environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostEnv {
    vars: BTreeMap<String, String>,
}

impl HostEnv {
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Set and non-empty.
    pub fn is_set(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| !v.is_empty())
    }

    /// Adapter for `Paths::resolve_with_env`.
    pub fn lookup(&self, key: &str) -> Result<String, std::env::VarError> {
        self.get(key)
            .map(str::to_string)
            .ok_or(std::env::VarError::NotPresent)
    }
}

/// Root of the host filesystem as seen by device and display probes.
///
/// Directives always name host paths; probing goes through the root so a
/// fake `/sys` and `/dev` tree can stand in for the real one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRoot {
    root: PathBuf,
}

/// One directory entry seen during a probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub is_dir: bool,
}

impl Default for HostRoot {
    fn default() -> Self {
        Self::system()
    }
}

impl HostRoot {
    pub fn system() -> Self {
        Self {
            root: PathBuf::from("/"),
        }
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map an absolute host path onto the probe root.
    pub fn probe(&self, host_path: impl AsRef<Path>) -> PathBuf {
        let host_path = host_path.as_ref();
        match host_path.strip_prefix("/") {
            Ok(rel) => self.root.join(rel),
            Err(_) => self.root.join(host_path),
        }
    }

    pub fn exists(&self, host_path: impl AsRef<Path>) -> bool {
        self.probe(host_path).exists()
    }

    pub fn is_dir(&self, host_path: impl AsRef<Path>) -> bool {
        self.probe(host_path).is_dir()
    }

    /// Directory listing sorted by name, so fragments come out in a stable order.
    pub fn list(&self, host_path: impl AsRef<Path>) -> io::Result<Vec<Entry>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(self.probe(host_path))? {
            let entry = entry?;
            entries.push(Entry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: entry.file_type().map(|t| t.is_dir()).unwrap_or(false),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    pub fn read_to_string(&self, host_path: impl AsRef<Path>) -> io::Result<String> {
        std::fs::read_to_string(self.probe(host_path))
    }
}

/// How the main application is started inside the sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchOptions {
    /// Replace the application with an interactive shell.
    pub debug_shell: bool,
    /// Start `busLaunchTarget` instead of `launchTarget`.
    pub bus_activation: bool,
    /// Extra arguments forwarded to the application.
    pub target_args: Vec<String>,
}

/// Everything one session needs, passed by reference to each component.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub profile: AppProfile,
    pub paths: AppPaths,
    pub home: PathBuf,
    pub config_home: PathBuf,
    pub env: HostEnv,
    pub root: HostRoot,
    pub tools: ToolsConfig,
    pub session: SessionConfig,
    pub launch: LaunchOptions,
    /// Debug logging requested; forwarded to the bus proxy.
    pub verbose: bool,
    /// Claimed instance id. Empty until allocation.
    pub instance_id: String,
}

impl SessionContext {
    pub fn new(
        profile: AppProfile,
        paths: &Paths,
        config: &Config,
        env: HostEnv,
        launch: LaunchOptions,
    ) -> Self {
        let app_paths = paths.for_app(&profile.app_id, &profile.state_directory);
        Self {
            paths: app_paths,
            home: paths.home.clone(),
            config_home: paths.config_home.clone(),
            profile,
            env,
            root: HostRoot::system(),
            tools: config.tools.clone(),
            session: config.session.clone(),
            launch,
            verbose: false,
            instance_id: String::new(),
        }
    }

    pub fn with_instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = id.into();
        self
    }

    pub fn runtime(&self) -> &Path {
        &self.paths.runtime
    }

    pub fn sandbox_home(&self) -> PathBuf {
        self.paths.sandbox_home()
    }

    /// Rewrite a host path below the user's home into the sandboxed home.
    pub fn translate_path(&self, path: &Path) -> PathBuf {
        match path.strip_prefix(&self.home) {
            Ok(rel) if rel.as_os_str().is_empty() => self.sandbox_home(),
            Ok(rel) => self.sandbox_home().join(rel),
            Err(_) => path.to_path_buf(),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fixtures shared by unit tests across modules.

    use super::*;
    use crate::config::parse_profile;

    pub const PROFILE: &str = "appID=top.kimiblock.test\nfriendlyName=Test\nstateDirectory=Test_Data\nlaunchTarget=/usr/bin/test-app\n";

    pub fn context_with(profile_extra: &str, env_pairs: &[(&str, &str)], root: &Path) -> SessionContext {
        let mut pairs = vec![
            ("HOME", "/home/alice"),
            ("XDG_CONFIG_HOME", "/home/alice/.config"),
            ("XDG_DATA_HOME", "/home/alice/.local/share"),
            ("XDG_RUNTIME_DIR", "/run/user/1000"),
        ];
        pairs.extend_from_slice(env_pairs);
        let env = HostEnv::from_pairs(pairs);
        let profile = parse_profile(&format!("{PROFILE}{profile_extra}"), &env).unwrap();
        let paths = Paths::resolve_with_env(|k| env.lookup(k)).unwrap();
        let mut ctx = SessionContext::new(
            profile,
            &paths,
            &Config::default(),
            env,
            LaunchOptions::default(),
        )
        .with_instance_id("1234567");
        ctx.root = HostRoot::at(root);
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::testing::context_with;
    use super::*;

    #[test]
    fn translate_path_rewrites_home_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_with("", &[], dir.path());
        assert_eq!(
            ctx.translate_path(Path::new("/home/alice/.config/fontconfig")),
            PathBuf::from("/home/alice/.local/share/Test_Data/.config/fontconfig")
        );
        assert_eq!(
            ctx.translate_path(Path::new("/etc/fonts")),
            PathBuf::from("/etc/fonts")
        );
    }

    #[test]
    fn host_root_lists_sorted_entries() {
        let dir = tempfile::tempdir().unwrap();
        let root = HostRoot::at(dir.path());
        std::fs::create_dir_all(dir.path().join("sys/class/drm/card1")).unwrap();
        std::fs::create_dir_all(dir.path().join("sys/class/drm/card0")).unwrap();
        std::fs::write(dir.path().join("sys/class/drm/version"), "").unwrap();

        let names: Vec<_> = root
            .list("/sys/class/drm")
            .unwrap()
            .into_iter()
            .map(|e| (e.name, e.is_dir))
            .collect();
        assert_eq!(
            names,
            vec![
                ("card0".to_string(), true),
                ("card1".to_string(), true),
                ("version".to_string(), false)
            ]
        );
    }

    #[test]
    fn host_env_is_set_ignores_empty() {
        let env = HostEnv::from_pairs([("A", ""), ("B", "x")]);
        assert!(!env.is_set("A"));
        assert!(env.is_set("B"));
        assert!(!env.is_set("C"));
    }
}
