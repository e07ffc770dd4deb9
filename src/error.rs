//! Error types shared across the launcher and the in-sandbox helper.
//!
//! Only fatal conditions become `Err`. Optional capabilities that cannot be
//! resolved are logged and produce empty fragments instead.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading an application profile.
#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("no profile given: set _portableConfig")]
    Unspecified,

    #[error("unable to locate profile {0}")]
    NotFound(String),

    #[error("profile is missing required field {0}")]
    MissingField(&'static str),

    #[error("invalid value for {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("failed to read profile {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors raised while compiling the sandbox policy.
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("wayland socket {0} not found while wayland-only mode is enforced")]
    DisplaySocketMissing(PathBuf),

    #[error("failed to start the bus proxy: {0}")]
    ProxyLaunch(String),

    #[error("bus proxy socket {0} did not appear in time")]
    ProxySocketTimeout(PathBuf),

    #[error("policy producer {producer} did not complete: {reason}")]
    Producer {
        producer: &'static str,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised by the session launcher and the control channel.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("XDG_RUNTIME_DIR is not set or is not a directory")]
    NoRuntimeDir,

    #[error("no free instance id after {0} attempts")]
    InstanceIdsExhausted(usize),

    #[error("control record {path} is malformed: {reason}")]
    ControlRecord { path: PathBuf, reason: String },

    #[error("failed to start the session supervisor: {0}")]
    SupervisorLaunch(String),

    #[error("unexpected control message {0:?}")]
    UnknownControlMessage(String),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Profile(#[from] ProfileError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised inside the sandbox by the session helper.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("launch target is empty")]
    EmptyTarget,

    #[error("failed to decode {name}: {source}")]
    Decode {
        name: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("control channel unavailable: {0}")]
    Control(#[from] SessionError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl PolicyError {
    pub fn producer(producer: &'static str, reason: impl ToString) -> Self {
        Self::Producer {
            producer,
            reason: reason.to_string(),
        }
    }
}
