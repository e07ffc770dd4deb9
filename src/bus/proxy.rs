//! Filtering bus proxy, run as its own transient unit in a minimal sandbox.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info};

use super::rules::{BusFlags, BusRule};
use crate::context::SessionContext;
use crate::error::PolicyError;
use crate::paths::create_dir_with_mode;

/// Capability flags derived from the profile and the desktop session.
pub fn bus_flags(ctx: &SessionContext) -> BusFlags {
    let profile = &ctx.profile;
    BusFlags {
        classic_notifications: profile.allow_classic_notifs,
        inhibit: profile.allow_inhibit,
        global_shortcuts: profile.allow_global_shortcuts,
        location: ctx
            .env
            .get("XDG_CURRENT_DESKTOP")
            .is_some_and(is_gnome_session),
    }
}

/// `XDG_CURRENT_DESKTOP` is a colon-separated list; any GNOME entry counts.
fn is_gnome_session(desktops: &str) -> bool {
    desktops
        .split(':')
        .any(|d| d.trim().eq_ignore_ascii_case("gnome"))
}

/// Full `systemd-run` argument vector for the proxy unit.
pub fn proxy_args(ctx: &SessionContext, rules: &[BusRule]) -> Vec<String> {
    let profile = &ctx.profile;
    let paths = &ctx.paths;
    let runtime = ctx.runtime().display().to_string();
    let info = paths.flatpak_info().display().to_string();
    let status_file = paths
        .instance_record_dir(&ctx.instance_id)
        .join("bwrapinfo.json");

    let mut args: Vec<String> = vec![
        "--user".into(),
        "-p".into(),
        format!("Slice=portable-{}.slice", profile.friendly_name),
        "-u".into(),
        format!("{}-dbus", profile.friendly_name),
    ];
    for property in [
        "KillMode=control-group",
        "Wants=xdg-document-portal.service xdg-desktop-portal.service",
        "After=xdg-document-portal.service xdg-desktop-portal.service",
        "SuccessExitStatus=SIGKILL",
    ] {
        args.extend(["-p".to_string(), property.to_string()]);
    }
    args.extend([
        "-p".to_string(),
        format!("StandardError=file:{}", status_file.display()),
        "--".to_string(),
        ctx.tools.bwrap.clone(),
    ]);
    args.extend(
        [
            "--json-status-fd", "2",
            "--unshare-all",
            "--symlink", "/usr/lib64", "/lib64",
            "--ro-bind", "/usr/lib", "/usr/lib",
            "--ro-bind", "/usr/lib64", "/usr/lib64",
            "--ro-bind", "/usr/bin", "/usr/bin",
            "--ro-bind-try", "/usr/share", "/usr/share",
        ]
        .map(String::from),
    );
    args.extend([
        "--bind".to_string(),
        runtime.clone(),
        runtime.clone(),
        "--ro-bind".to_string(),
        info.clone(),
        format!("{runtime}/.flatpak-info"),
        "--ro-bind".to_string(),
        info,
        "/.flatpak-info".to_string(),
        "--".to_string(),
        ctx.tools.dbus_proxy.clone(),
        ctx.env
            .get("DBUS_SESSION_BUS_ADDRESS")
            .unwrap_or_default()
            .to_string(),
        paths.bus_socket().display().to_string(),
    ]);
    if ctx.verbose {
        args.push("--log".to_string());
    }
    args.push("--filter".to_string());
    args.extend(rules.iter().map(BusRule::to_arg));
    args
}

/// Start the proxy unit. Failure to start it is fatal.
pub async fn launch_proxy(ctx: &SessionContext, rules: &[BusRule]) -> Result<(), PolicyError> {
    create_dir_with_mode(&ctx.paths.bus_dir(), 0o700)?;
    create_dir_with_mode(&ctx.paths.a11y_dir(), 0o700)?;

    info!("Starting D-Bus proxy");
    let args = proxy_args(ctx, rules);
    debug!("Proxy arguments: {}", args.join(" "));
    let output = Command::new(&ctx.tools.systemd_run)
        .args(&args)
        .stdin(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| PolicyError::ProxyLaunch(format!("{}: {}", ctx.tools.systemd_run, e)))?;
    if !output.status.success() {
        return Err(PolicyError::ProxyLaunch(format!(
            "{} exited with {}: {}",
            ctx.tools.systemd_run,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Poll for `socket` at a fixed interval until `timeout` elapses.
pub async fn wait_for_socket(
    socket: &Path,
    timeout: Duration,
    interval: Duration,
) -> Result<(), PolicyError> {
    let deadline = Instant::now() + timeout;
    loop {
        if tokio::fs::try_exists(socket).await.unwrap_or(false) {
            debug!("Bus proxy socket ready at {}", socket.display());
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(PolicyError::ProxySocketTimeout(socket.to_path_buf()));
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::rules::build_rules;
    use crate::context::testing::context_with;

    #[test]
    fn filter_precedes_rules() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context_with(
            "",
            &[("DBUS_SESSION_BUS_ADDRESS", "unix:path=/run/user/1000/bus")],
            dir.path(),
        );
        ctx.verbose = true;
        let rules = build_rules(&ctx.profile.app_id, &bus_flags(&ctx), None);
        let args = proxy_args(&ctx, &rules);

        let filter = args.iter().position(|a| a == "--filter").unwrap();
        assert_eq!(args[filter - 1], "--log");
        assert_eq!(args[filter - 2], "/run/user/1000/app/top.kimiblock.test/bus");
        assert_eq!(args[filter - 3], "unix:path=/run/user/1000/bus");
        assert_eq!(args[filter + 1], rules[0].to_arg());
        assert_eq!(args.len(), filter + 1 + rules.len());
        assert!(args.contains(&"Test-dbus".to_string()));
    }

    #[test]
    fn gnome_enables_location() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_with("", &[("XDG_CURRENT_DESKTOP", "GNOME")], dir.path());
        assert!(bus_flags(&ctx).location);
        let ctx = context_with("", &[("XDG_CURRENT_DESKTOP", "KDE")], dir.path());
        assert!(!bus_flags(&ctx).location);
    }

    #[test]
    fn desktop_list_is_split_on_colons() {
        assert!(is_gnome_session("ubuntu:GNOME"));
        assert!(is_gnome_session("gnome"));
        assert!(!is_gnome_session("GNOME-Flashback-ish"));
        assert!(!is_gnome_session("KDE:Plasma"));
        assert!(!is_gnome_session(""));
    }

    #[tokio::test]
    async fn socket_wait_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("bus");
        let err = wait_for_socket(&socket, Duration::from_millis(30), Duration::from_millis(5))
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyError::ProxySocketTimeout(p) if p == socket));
    }

    #[tokio::test]
    async fn socket_wait_sees_late_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("bus");
        let late = socket.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            std::fs::write(late, "").unwrap();
        });
        wait_for_socket(&socket, Duration::from_secs(2), Duration::from_millis(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn launch_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context_with("", &[], dir.path());
        ctx.paths.runtime = dir.path().to_path_buf();
        ctx.tools.systemd_run = "/nonexistent/systemd-run".into();
        let err = launch_proxy(&ctx, &[]).await.unwrap_err();
        assert!(matches!(err, PolicyError::ProxyLaunch(_)));
        assert!(ctx.paths.bus_dir().is_dir());
    }
}
