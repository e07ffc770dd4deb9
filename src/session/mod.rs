//! Host-side session lifecycle: prepare, launch, wait, tear down.
//!
//! Every fatal error after the instance id is claimed goes through
//! [`abort`], which runs the full teardown before handing the error back.

pub mod flatpak_info;
pub mod housekeeping;
pub mod instance;
pub mod launcher;
pub mod teardown;

use std::io;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

pub use instance::{ControlRecord, allocate_instance_id, random_candidate};
pub use launcher::{RunningSession, SessionEnd, exit_code, unit_args};
pub use teardown::{TeardownReport, teardown};

use crate::context::SessionContext;
use crate::control::ControlListener;
use crate::devices::DeviceResolver;
use crate::error::SessionError;
use crate::paths::create_dir_with_mode;
use crate::policy::{self, AssembledPolicy, ProxyMode, env::write_bashrc};

/// Run an external tool to completion, treating a non-zero exit as an error.
pub(crate) async fn run_tool(program: &str, args: &[String]) -> io::Result<()> {
    let output = Command::new(program).args(args).output().await?;
    if output.status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

/// Tear down, then return `err`.
pub async fn abort<E>(ctx: &SessionContext, err: E) -> E
where
    E: std::fmt::Display,
{
    error!("Fatal: {}", err);
    let report = teardown(ctx).await;
    if !report.is_clean() {
        warn!("Teardown after failure was incomplete: {:?}", report);
    }
    err
}

/// Claim an instance id and persist the per-instance records.
fn prepare_instance(ctx: SessionContext) -> Result<SessionContext, SessionError> {
    let id = allocate_instance_id(
        &ctx.paths.flatpak_root(),
        ctx.session.instance_id_attempts,
        random_candidate,
    )?;
    info!("Claimed instance ID {}", id);
    Ok(ctx.with_instance_id(id))
}

fn write_records(ctx: &SessionContext, policy: &AssembledPolicy) -> Result<(), SessionError> {
    policy.env.write_to(&ctx.paths.env_file())?;
    if let Err(e) = write_bashrc(ctx) {
        warn!("Unable to write bashrc: {}", e);
    }
    Ok(())
}

async fn launch(
    ctx: &Arc<SessionContext>,
    resolver: Arc<dyn DeviceResolver>,
) -> Result<Finished, SessionError> {
    create_dir_with_mode(&ctx.paths.instance_dir(), 0o700)?;
    ControlRecord::for_session(ctx).write(&ctx.paths.control_file())?;
    flatpak_info::install(ctx)?;
    housekeeping::install_desktop_stub(ctx);

    create_dir_with_mode(&ctx.paths.control_dir(), 0o700)?;
    let control = ControlListener::bind(&ctx.paths.control_socket())?;

    let policy = policy::assemble(Arc::clone(ctx), resolver, ProxyMode::Launch).await?;
    write_records(ctx, &policy)?;

    let background = Arc::clone(ctx);
    tokio::spawn(async move { housekeeping::grant_background(&background).await });

    let running = RunningSession::start(ctx, &policy.command)?;
    finish(ctx, running, &control).await
}

/// A session that has ended. `teardown` is set when teardown already ran
/// while the session was being stopped.
#[derive(Debug)]
struct Finished {
    code: i32,
    teardown: Option<TeardownReport>,
}

async fn finish(
    ctx: &SessionContext,
    mut running: RunningSession,
    control: &ControlListener,
) -> Result<Finished, SessionError> {
    let (status, report) = match running.wait(control).await? {
        SessionEnd::Exited(status) => (status, None),
        SessionEnd::Terminated => {
            let report = teardown(ctx).await;
            debug!("Teardown finished: {:?}", report);
            (running.collect().await?, Some(report))
        }
    };
    info!("Sandbox exited with {}", status);
    Ok(Finished {
        code: exit_code(status),
        teardown: report,
    })
}

/// Tear down unless that already happened, then hand back the exit code.
async fn complete(ctx: &SessionContext, finished: Finished) -> i32 {
    let report = match finished.teardown {
        Some(report) => report,
        None => teardown(ctx).await,
    };
    if !report.is_clean() {
        warn!("Teardown incomplete: {:?}", report);
    }
    finished.code
}

/// Start a session and block until it ends. Returns the supervisor's exit code.
pub async fn run(ctx: SessionContext, resolver: Arc<dyn DeviceResolver>) -> Result<i32, SessionError> {
    if !ctx.paths.runtime.is_dir() {
        return Err(SessionError::NoRuntimeDir);
    }
    housekeeping::clean_stale_units(&ctx).await;

    let ctx = Arc::new(prepare_instance(ctx)?);
    match launch(&ctx, resolver).await {
        Ok(finished) => Ok(complete(&ctx, finished).await),
        Err(e) => Err(abort(&ctx, e).await),
    }
}

/// Normal-mode stop request for a running instance.
pub async fn stop(ctx: &SessionContext) -> TeardownReport {
    info!("Stopping {}", ctx.profile.app_id);
    teardown(ctx).await
}

/// Compile the policy without touching the host.
pub async fn dry_run(
    ctx: SessionContext,
    resolver: Arc<dyn DeviceResolver>,
) -> Result<(Vec<String>, AssembledPolicy), SessionError> {
    let ctx = Arc::new(ctx);
    let policy = policy::assemble(Arc::clone(&ctx), resolver, ProxyMode::DryRun).await?;
    let args = unit_args(&ctx, &policy.command)?;
    Ok((args, policy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::context_with;
    use crate::control::{self, ControlMessage};
    use crate::devices::MockDeviceResolver;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    /// Shell script that appends its arguments to `log`.
    fn recording_tool(dir: &Path, name: &str, log: &Path) -> String {
        let script = dir.join(name);
        std::fs::write(&script, format!("#!/bin/sh\necho \"$@\" >> {}\n", log.display())).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn tool_failure_is_an_error() {
        assert!(run_tool("/nonexistent/tool", &[]).await.is_err());
        assert!(run_tool("false", &[]).await.is_err());
        assert!(run_tool("true", &[]).await.is_ok());
    }

    #[tokio::test]
    async fn fatal_error_tears_down_instance_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context_with(
            "waylandOnly=true\n",
            &[("XDG_SESSION_TYPE", "wayland")],
            dir.path(),
        );
        ctx.paths.runtime = dir.path().join("run");
        ctx.paths.data_home = dir.path().join("data");
        ctx.tools.systemctl = "/nonexistent/systemctl".into();
        ctx.tools.systemd_run = "/nonexistent/systemd-run".into();
        ctx.tools.flatpak_info_template = dir.path().join("none");
        std::fs::create_dir_all(&ctx.paths.runtime).unwrap();

        let mut resolver = MockDeviceResolver::new();
        resolver.expect_device_path().never();

        let err = run(ctx.clone(), Arc::new(resolver)).await.unwrap_err();
        assert!(matches!(err, SessionError::Policy(_)));
        assert!(!ctx.paths.instance_dir().exists());
        assert!(!ctx.paths.bus_dir().exists());
        let leftovers: Vec<_> = std::fs::read_dir(ctx.paths.flatpak_root())
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn dry_run_has_no_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context_with(
            "waylandOnly=false\n",
            &[("XDG_SESSION_TYPE", "x11")],
            dir.path(),
        );
        ctx.paths.runtime = dir.path().join("run");
        ctx.paths.data_home = dir.path().join("data");
        let mut resolver = MockDeviceResolver::new();
        resolver.expect_device_path().never();

        let (args, policy) = dry_run(ctx.clone(), Arc::new(resolver)).await.unwrap();
        assert!(args.iter().any(|a| a == "--"));
        assert!(!policy.bus_rules.is_empty());
        assert!(!ctx.paths.runtime.exists());
        assert!(!ctx.paths.user_env_file().exists());
    }

    #[tokio::test]
    async fn dry_run_with_pipewire_starts_no_unit() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context_with(
            "waylandOnly=false\nbindPipewire=true\n",
            &[("XDG_SESSION_TYPE", "x11")],
            dir.path(),
        );
        ctx.paths.runtime = dir.path().join("run");
        ctx.paths.data_home = dir.path().join("data");
        let log = dir.path().join("systemd-run.log");
        ctx.tools.systemd_run = recording_tool(dir.path(), "systemd-run", &log);
        let mut resolver = MockDeviceResolver::new();
        resolver.expect_device_path().never();

        let (args, _) = dry_run(ctx.clone(), Arc::new(resolver)).await.unwrap();
        assert!(args.iter().any(|a| a == "--"));
        assert!(!log.exists());
    }

    #[tokio::test]
    async fn terminated_session_tears_down_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context_with("", &[], dir.path());
        ctx.paths.runtime = dir.path().join("run");
        ctx.paths.data_home = dir.path().join("data");
        let log = dir.path().join("systemctl.log");
        ctx.tools.systemctl = recording_tool(dir.path(), "systemctl", &log);

        let socket = dir.path().join("control");
        let listener = ControlListener::bind(&socket).unwrap();
        let child = Command::new("sh").args(["-c", "sleep 0.2; exit 4"]).spawn().unwrap();
        control::send(&socket, ControlMessage::TerminateNow).await.unwrap();

        let finished = finish(&ctx, RunningSession::from_child(child), &listener)
            .await
            .unwrap();
        assert!(finished.teardown.is_some());
        assert_eq!(complete(&ctx, finished).await, 4);

        let calls = std::fs::read_to_string(&log).unwrap();
        let stops = calls.lines().filter(|l| l.starts_with("--user stop ")).count();
        assert_eq!(stops, 2, "{calls}");
    }

    #[tokio::test]
    async fn exited_session_is_torn_down_after() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context_with("", &[], dir.path());
        ctx.paths.runtime = dir.path().join("run");
        ctx.paths.data_home = dir.path().join("data");
        let log = dir.path().join("systemctl.log");
        ctx.tools.systemctl = recording_tool(dir.path(), "systemctl", &log);

        let listener = ControlListener::bind(&dir.path().join("control")).unwrap();
        let child = Command::new("sh").args(["-c", "exit 3"]).spawn().unwrap();
        let finished = finish(&ctx, RunningSession::from_child(child), &listener)
            .await
            .unwrap();
        assert!(finished.teardown.is_none());
        assert!(!log.exists());
        assert_eq!(complete(&ctx, finished).await, 3);

        let calls = std::fs::read_to_string(&log).unwrap();
        assert_eq!(calls.lines().filter(|l| l.starts_with("--user stop ")).count(), 2);
    }
}
