//! Restricted PipeWire security context.
//!
//! `pw-container` runs in the app slice and prints the socket it created;
//! the socket is bound into the sandbox. Any failure here only costs audio.

use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use super::{Fragment, ProxyMode};
use crate::context::SessionContext;

const SOCKET_PREFIX: &str = "new socket: ";

const CONTAINER_PROPERTIES: &str =
    r#"{ "pipewire.sec.engine": "top.kimiblock.portable", "pipewire.access": "restricted" }"#;

/// Arguments for the transient unit hosting `pw-container`.
pub fn container_args(ctx: &SessionContext) -> Vec<String> {
    let profile = &ctx.profile;
    let mut args: Vec<String> = vec!["--user".into(), "--quiet".into(), "--pipe".into(), "-p".into()];
    args.push(format!("Slice=portable-{}.slice", profile.friendly_name));
    args.push("-u".into());
    args.push(format!("app-portable-{}-pipewire-container", profile.app_id));
    for property in [
        "KillMode=control-group",
        "After=pipewire.service",
        "Requires=pipewire.service",
        "Wants=wireplumber.service",
        "SuccessExitStatus=SIGKILL",
    ] {
        args.push("-p".into());
        args.push(property.into());
    }
    args.extend(["--", "stdbuf", "-oL"].map(String::from));
    args.push(ctx.tools.pw_container.clone());
    args.push("-P".into());
    args.push(CONTAINER_PROPERTIES.into());
    args
}

/// Read lines until the socket announcement, returning the reader so the
/// rest of the output can be drained.
async fn read_socket<R>(mut reader: R) -> std::io::Result<(Option<PathBuf>, R)>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok((None, reader));
        }
        if let Some(path) = line.trim_end().strip_prefix(SOCKET_PREFIX) {
            return Ok((Some(PathBuf::from(path)), reader));
        }
    }
}

async fn start_container(ctx: &SessionContext) -> Result<PathBuf, String> {
    let mut child = Command::new(&ctx.tools.systemd_run)
        .args(container_args(ctx))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| format!("failed to start {}: {}", ctx.tools.systemd_run, e))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "no stdout pipe".to_string())?;

    let timeout = ctx.session.pipewire_timeout();
    let (socket, mut reader) = match tokio::time::timeout(timeout, read_socket(BufReader::new(stdout))).await {
        Ok(Ok(found)) => found,
        Ok(Err(e)) => return Err(format!("reading pw-container output: {e}")),
        Err(_) => return Err(format!("no socket within {timeout:?}")),
    };
    let socket = socket.ok_or_else(|| "pw-container exited without a socket".to_string())?;

    // Keep the pipe open and the unit wrapper reaped for the session lifetime.
    tokio::spawn(async move {
        let mut sink = tokio::io::sink();
        let _ = tokio::io::copy_buf(&mut reader, &mut sink).await;
        let _ = child.wait().await;
    });
    Ok(socket)
}

/// Under [`ProxyMode::DryRun`] no container is started and the fragment
/// stays empty.
pub async fn audio_fragment(ctx: &SessionContext, mode: ProxyMode) -> Fragment {
    let mut fragment = Fragment::new("audio");
    if !ctx.profile.bind_pipewire {
        return fragment;
    }
    if mode == ProxyMode::DryRun {
        debug!("Dry run, not starting pw-container");
        return fragment;
    }
    match start_container(ctx).await {
        Ok(socket) => {
            debug!("pw-container available at {}", socket.display());
            fragment.directives.rw_bind(&socket, &socket);
        }
        Err(reason) => warn!("Failed to set up PipeWire security context: {}", reason),
    }
    fragment
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::context_with;

    #[tokio::test]
    async fn finds_announced_socket() {
        let output: &[u8] = b"starting\nnew socket: /run/user/1000/pipewire-0-manager-3\nmore\n";
        let (socket, _) = read_socket(BufReader::new(output)).await.unwrap();
        assert_eq!(
            socket,
            Some(PathBuf::from("/run/user/1000/pipewire-0-manager-3"))
        );
    }

    #[tokio::test]
    async fn eof_without_socket() {
        let output: &[u8] = b"error: no pipewire\n";
        let (socket, _) = read_socket(BufReader::new(output)).await.unwrap();
        assert!(socket.is_none());
    }

    #[tokio::test]
    async fn disabled_yields_empty_fragment() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_with("", &[], dir.path());
        assert!(audio_fragment(&ctx, ProxyMode::Launch).await.is_empty());
    }

    #[tokio::test]
    async fn launch_failure_is_soft() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context_with("bindPipewire=true\n", &[], dir.path());
        ctx.tools.systemd_run = "/nonexistent/systemd-run".into();
        assert!(audio_fragment(&ctx, ProxyMode::Launch).await.is_empty());
    }

    #[tokio::test]
    async fn dry_run_starts_no_container() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("started");
        let script = dir.path().join("systemd-run");
        std::fs::write(
            &script,
            format!("#!/bin/sh\ntouch {}\necho 'new socket: /tmp/pw'\n", marker.display()),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut ctx = context_with("bindPipewire=true\n", &[], dir.path());
        ctx.tools.systemd_run = script.to_string_lossy().into_owned();
        assert!(audio_fragment(&ctx, ProxyMode::DryRun).await.is_empty());
        assert!(!marker.exists());
    }

    #[test]
    fn container_runs_in_app_slice() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_with("", &[], dir.path());
        let args = container_args(&ctx);
        assert!(args.contains(&"Slice=portable-Test.slice".to_string()));
        assert!(args.contains(&"app-portable-top.kimiblock.test-pipewire-container".to_string()));
        assert_eq!(args.last().unwrap(), CONTAINER_PROPERTIES);
    }
}
