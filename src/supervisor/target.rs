//! Resolve the main application's command line from the unit environment.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::context::HostEnv;
use crate::error::SupervisorError;

const DEBUG_SHELL: &[&str] = &["/usr/bin/bash", "--noprofile", "--rcfile", "/run/bashrc"];

/// Host path to in-sandbox path substitutions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassFiles {
    #[serde(rename = "FileMap", default)]
    pub file_map: BTreeMap<String, String>,
}

impl PassFiles {
    /// Substitute every occurrence of each host path. Longer keys win when
    /// one key is a prefix of another.
    pub fn replace(&self, args: &[String]) -> Vec<String> {
        if self.file_map.is_empty() {
            return args.to_vec();
        }
        let mut keys: Vec<&String> = self.file_map.keys().filter(|k| !k.is_empty()).collect();
        keys.sort_by_key(|k| std::cmp::Reverse(k.len()));
        args.iter().map(|arg| replace_all(arg, &keys, &self.file_map)).collect()
    }
}

fn replace_all(arg: &str, keys: &[&String], map: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(arg.len());
    let mut rest = arg;
    'scan: while !rest.is_empty() {
        for key in keys {
            if let Some(tail) = rest.strip_prefix(key.as_str()) {
                out.push_str(&map[key.as_str()]);
                rest = tail;
                continue 'scan;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            out.push(c);
        }
        rest = chars.as_str();
    }
    out
}

/// What the helper should run, derived once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPlan {
    /// Main application command line.
    pub main: Vec<String>,
    /// Launch target and its fixed arguments, prepended to auxiliary
    /// requests that do not set a custom target.
    pub prefix: Vec<String>,
}

fn split_target(raw: &str) -> Vec<String> {
    raw.split(' ').filter(|s| !s.is_empty()).map(String::from).collect()
}

fn decode_target_args(env: &HostEnv) -> Result<Vec<String>, SupervisorError> {
    match env.get("targetArgs") {
        None | Some("") => Ok(Vec::new()),
        Some(raw) => serde_json::from_str(raw).map_err(|source| SupervisorError::Decode {
            name: "targetArgs",
            source,
        }),
    }
}

pub fn extra_files(env: &HostEnv) -> Result<Option<PassFiles>, SupervisorError> {
    match env.get("_portableHelperExtraFiles") {
        None | Some("") => Ok(None),
        Some(raw) => serde_json::from_str(raw)
            .map(Some)
            .map_err(|source| SupervisorError::Decode {
                name: "_portableHelperExtraFiles",
                source,
            }),
    }
}

impl TargetPlan {
    pub fn from_env(env: &HostEnv) -> Result<Self, SupervisorError> {
        let prefix = split_target(env.get("launchTarget").unwrap_or_default());
        if prefix.is_empty() {
            return Err(SupervisorError::EmptyTarget);
        }
        let target_args = decode_target_args(env)?;
        debug!("Got raw command line arguments: {}", target_args.join(" "));

        let mut main = if env.get("_portableDebug") == Some("1") {
            info!("Starting debug shell");
            DEBUG_SHELL.iter().map(|s| s.to_string()).collect()
        } else if env.get("_portableBusActivate") == Some("1") {
            match env.get("busLaunchTarget").map(split_target) {
                Some(bus) if !bus.is_empty() => {
                    info!("Starting bus activation target");
                    let mut bus = bus;
                    bus.extend(target_args);
                    bus
                }
                _ => {
                    warn!("Undefined busLaunchTarget, starting the launch target");
                    let mut cmd = prefix.clone();
                    cmd.extend(target_args);
                    cmd
                }
            }
        } else {
            let mut cmd = prefix.clone();
            cmd.extend(target_args);
            cmd
        };
        main.retain(|arg| !arg.is_empty());

        if let Some(files) = extra_files(env)? {
            debug!("Replacing cmdline using file map: {:?}", files.file_map);
            main = files.replace(&main);
        }
        Ok(Self { main, prefix })
    }

    /// Command line for an auxiliary request.
    pub fn auxiliary(&self, exec: &[String], custom_target: bool, files: &PassFiles) -> Vec<String> {
        let cmdline = if custom_target {
            exec.to_vec()
        } else {
            self.prefix.iter().chain(exec).cloned().collect()
        };
        files.replace(&cmdline)
    }
}
