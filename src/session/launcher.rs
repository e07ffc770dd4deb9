//! The transient unit that runs the sandbox, and the wait for its end.

use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tracing::{debug, info};

use crate::context::SessionContext;
use crate::control::{ControlListener, ControlMessage};
use crate::error::SessionError;
use crate::policy::SandboxCommand;

/// Service-manager properties of the sandbox unit.
const UNIT_PROPERTIES: &[&str] = &[
    "Delegate=yes",
    "DelegateSubgroup=portable-cgroup",
    "ExitType=cgroup",
    "NotifyAccess=all",
    "TimeoutStartSec=infinity",
    "OOMPolicy=stop",
    "SecureBits=noroot-locked",
    "NoNewPrivileges=yes",
    "KillMode=control-group",
    "MemoryHigh=90%",
    "ManagedOOMSwap=kill",
    "ManagedOOMMemoryPressure=kill",
    "OOMScoreAdjust=100",
    "IPAccounting=yes",
    "MemoryPressureWatch=yes",
    "SystemCallLog=@privileged @debug @cpu-emulation @obsolete io_uring_enter io_uring_register io_uring_setup @resources",
    "SystemCallLog=~@sandbox",
    "PrivateIPC=yes",
    "ProtectClock=yes",
    "CapabilityBoundingSet=",
    "RestrictSUIDSGID=yes",
    "LockPersonality=yes",
    "RestrictRealtime=yes",
    "ProtectProc=invisible",
    "ProcSubset=pid",
    "PrivateUsers=yes",
    "ProtectControlGroups=private",
    "PrivateMounts=yes",
    "ProtectHome=no",
    "KeyringMode=private",
    "TimeoutStopSec=10s",
    "UMask=077",
    "UnsetEnvironment=GNOME_SETUP_DISPLAY",
    "UnsetEnvironment=PIPEWIRE_REMOTE",
    "UnsetEnvironment=PAM_KWALLET5_LOGIN",
    "UnsetEnvironment=GTK2_RC_FILES",
    "UnsetEnvironment=ICEAUTHORITY",
    "UnsetEnvironment=MANAGERPID",
    "UnsetEnvironment=INVOCATION_ID",
    "UnsetEnvironment=MANAGERPIDFDID",
    "UnsetEnvironment=SSH_AUTH_SOCK",
    "UnsetEnvironment=MAIL",
    "UnsetEnvironment=SYSTEMD_EXEC_PID",
    "ExecReload=bash -c 'kill --signal SIGALRM 2'",
    "ReloadSignal=SIGALRM",
    "SystemCallFilter=~@clock",
    "SystemCallFilter=~@cpu-emulation",
    "SystemCallFilter=~@module",
    "SystemCallFilter=~@obsolete",
    "SystemCallFilter=~@raw-io",
    "SystemCallFilter=~@reboot",
    "SystemCallFilter=~@swap",
    "SystemCallErrorNumber=EAGAIN",
];

pub fn unit_name(ctx: &SessionContext) -> String {
    format!("app-portable-{}", ctx.profile.app_id)
}

/// Full `systemd-run` argument vector: unit options, then the sandboxing
/// tool and its directives, then the exec target.
pub fn unit_args(ctx: &SessionContext, command: &SandboxCommand) -> Result<Vec<String>, SessionError> {
    let profile = &ctx.profile;
    let paths = &ctx.paths;
    let mut args = Vec::with_capacity(UNIT_PROPERTIES.len() * 2 + command.directives().len() * 3 + 32);
    if !ctx.verbose {
        args.push("--quiet".to_string());
    }
    args.extend(
        [
            "--user",
            "--pty",
            "--service-type=notify-reload",
            "--wait",
        ]
        .map(String::from),
    );
    args.push(format!("--unit={}", unit_name(ctx)));
    args.push("--slice=app.slice".to_string());

    let mut property = |value: String| {
        args.push("-p".to_string());
        args.push(value);
    };
    property(format!("BindsTo={}-dbus.service", profile.friendly_name));
    property(format!(
        "Description=Portable Sandbox for {} ({})",
        profile.friendly_name, profile.app_id
    ));
    property(format!("SyslogIdentifier=portable-{}", profile.app_id));
    for value in UNIT_PROPERTIES {
        property((*value).to_string());
    }
    property(format!("EnvironmentFile={}", paths.env_file().display()));
    property(format!("Environment=instanceId={}", ctx.instance_id));
    property(format!("Environment=busDir={}", paths.bus_dir().display()));
    property(format!("WorkingDirectory={}", ctx.sandbox_home().display()));
    if profile.bind_network {
        info!("Network access allowed");
        property("PrivateNetwork=no".to_string());
    } else {
        info!("Network access disabled");
        property("PrivateNetwork=yes".to_string());
    }

    let launch = &ctx.launch;
    let target_args = serde_json::to_string(&launch.target_args)
        .map_err(|e| SessionError::SupervisorLaunch(format!("encoding targetArgs: {e}")))?;
    args.push(format!("--setenv=targetArgs={target_args}"));
    if launch.debug_shell {
        args.push("--setenv=_portableDebug=1".to_string());
    }
    if launch.bus_activation {
        args.push("--setenv=_portableBusActivate=1".to_string());
    }

    args.push("--".to_string());
    args.push(ctx.tools.bwrap.clone());
    args.extend(command.args());
    Ok(args)
}

/// How the session ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// The supervisor process exited on its own.
    Exited(ExitStatus),
    /// The helper reported that every tracked process is gone; the
    /// supervisor's status is collected after teardown.
    Terminated,
}

/// A started sandbox unit.
#[derive(Debug)]
pub struct RunningSession {
    child: tokio::process::Child,
}

impl RunningSession {
    pub fn start(ctx: &SessionContext, command: &SandboxCommand) -> Result<Self, SessionError> {
        let args = unit_args(ctx, command)?;
        debug!("Calculated arguments for systemd-run: {}", args.join(" "));
        let child = Command::new(&ctx.tools.systemd_run)
            .args(&args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| SessionError::SupervisorLaunch(format!("{}: {}", ctx.tools.systemd_run, e)))?;
        Ok(Self::from_child(child))
    }

    pub(crate) fn from_child(child: tokio::process::Child) -> Self {
        Self { child }
    }

    /// Wait for the supervisor to exit or for a termination request.
    pub async fn wait(&mut self, control: &ControlListener) -> Result<SessionEnd, SessionError> {
        tokio::select! {
            status = self.child.wait() => Ok(SessionEnd::Exited(status?)),
            message = control.recv() => match message? {
                ControlMessage::TerminateNow => {
                    info!("Received termination request");
                    Ok(SessionEnd::Terminated)
                }
            },
        }
    }

    pub async fn collect(mut self) -> Result<ExitStatus, SessionError> {
        Ok(self.child.wait().await?)
    }
}

/// Process exit code for a supervisor status; signals map to 128 + n.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}
