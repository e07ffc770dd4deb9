//! Display access: X11 sockets and authority, and the Wayland socket.

use std::path::PathBuf;
use tracing::{debug, info, warn};

use super::Fragment;
use crate::context::SessionContext;
use crate::error::PolicyError;

/// Sandbox path of the X authority file.
pub const XAUTHORITY_DEST: &str = "/run/.Xauthority";

/// X11 sockets and the authority file. Empty under wayland-only.
pub fn xauth_fragment(ctx: &SessionContext) -> Fragment {
    let mut fragment = Fragment::new("xauth");
    if ctx.profile.wayland_only {
        return fragment;
    }
    fragment
        .directives
        .rw_bind_try("/tmp/.X11-unix", "/tmp/.X11-unix")
        .rw_bind_try("/tmp/.XIM-unix", "/tmp/.XIM-unix");

    let explicit = ctx
        .env
        .get("XAUTHORITY")
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .filter(|p| ctx.root.exists(p));
    let authority = match explicit {
        Some(path) => {
            debug!("XAUTHORITY specified as {}", path.display());
            Some(path)
        }
        None => {
            let implied = ctx.home.join(".Xauthority");
            if ctx.root.exists(&implied) {
                warn!("Implied XAUTHORITY {}, this is not recommended", implied.display());
                Some(implied)
            } else {
                warn!("Could not locate XAUTHORITY file");
                None
            }
        }
    };
    if let Some(path) = authority {
        fragment.directives.ro_bind(path, XAUTHORITY_DEST);
        fragment.env.push(format!("XAUTHORITY={XAUTHORITY_DEST}"));
    }
    fragment
        .env
        .push(format!("DISPLAY={}", ctx.env.get("DISPLAY").unwrap_or_default()));
    fragment
}

/// Locate the compositor socket on the host.
fn wayland_socket(ctx: &SessionContext) -> Option<PathBuf> {
    let runtime = ctx.runtime();
    match ctx.env.get("WAYLAND_DISPLAY").filter(|v| !v.is_empty()) {
        None => {
            debug!("WAYLAND_DISPLAY unset, trying default");
            let default = runtime.join("wayland-0");
            ctx.root.exists(&default).then_some(default)
        }
        Some(name) => {
            let relative = runtime.join(name);
            if ctx.root.exists(&relative) {
                return Some(relative);
            }
            info!("Wayland socket {} not found under the runtime directory", name);
            let absolute = PathBuf::from(name);
            (absolute.is_absolute() && ctx.root.exists(&absolute)).then_some(absolute)
        }
    }
}

/// Wayland socket, always exposed as `<runtime>/wayland-0`.
///
/// A missing socket is fatal only when wayland-only mode is in force.
pub fn wayland_fragment(ctx: &SessionContext) -> Result<Fragment, PolicyError> {
    let mut fragment = Fragment::new("display");
    match ctx.env.get("XDG_SESSION_TYPE") {
        Some("x11") => {
            warn!("Running on X11, this is insecure");
            return Ok(fragment);
        }
        Some("wayland") => debug!("Running under Wayland"),
        _ => warn!("Unknown XDG_SESSION_TYPE, treating as wayland"),
    }

    let dest = ctx.runtime().join("wayland-0");
    match wayland_socket(ctx) {
        Some(socket) => {
            debug!("Found Wayland socket: {}", socket.display());
            fragment.directives.ro_bind(socket, dest);
        }
        None if ctx.profile.wayland_only => {
            return Err(PolicyError::DisplaySocketMissing(dest));
        }
        None => warn!("Unable to find Wayland socket, continuing without it"),
    }
    Ok(fragment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::context_with;
    use crate::policy::{BindMode, Directive};
    use std::fs;

    #[test]
    fn xauth_prefers_explicit_authority() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("tmp")).unwrap();
        fs::write(dir.path().join("tmp/xauth_abc"), "").unwrap();
        let ctx = context_with(
            "waylandOnly=false\n",
            &[("XAUTHORITY", "/tmp/xauth_abc"), ("DISPLAY", ":0")],
            dir.path(),
        );
        let fragment = xauth_fragment(&ctx);
        assert_eq!(
            fragment.directives.effective(XAUTHORITY_DEST),
            Some(&Directive::bind(BindMode::ReadOnly, "/tmp/xauth_abc", XAUTHORITY_DEST))
        );
        assert_eq!(fragment.env, ["XAUTHORITY=/run/.Xauthority", "DISPLAY=:0"]);
    }

    #[test]
    fn xauth_falls_back_to_home() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("home/alice")).unwrap();
        fs::write(dir.path().join("home/alice/.Xauthority"), "").unwrap();
        let ctx = context_with("waylandOnly=false\n", &[], dir.path());
        let fragment = xauth_fragment(&ctx);
        assert!(matches!(
            fragment.directives.effective(XAUTHORITY_DEST),
            Some(Directive::Bind { source, .. }) if source == &PathBuf::from("/home/alice/.Xauthority")
        ));
    }

    #[test]
    fn xauth_empty_under_wayland_only() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_with("waylandOnly=true\n", &[], dir.path());
        assert!(xauth_fragment(&ctx).is_empty());
    }

    #[test]
    fn wayland_socket_bound_to_fixed_name() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("run/user/1000")).unwrap();
        fs::write(dir.path().join("run/user/1000/wayland-1"), "").unwrap();
        let ctx = context_with(
            "",
            &[("XDG_SESSION_TYPE", "wayland"), ("WAYLAND_DISPLAY", "wayland-1")],
            dir.path(),
        );
        let fragment = wayland_fragment(&ctx).unwrap();
        assert_eq!(
            fragment.directives.effective("/run/user/1000/wayland-0"),
            Some(&Directive::bind(
                BindMode::ReadOnly,
                "/run/user/1000/wayland-1",
                "/run/user/1000/wayland-0"
            ))
        );
    }

    #[test]
    fn missing_socket_is_fatal_only_when_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let enforced = context_with(
            "waylandOnly=true\n",
            &[("XDG_SESSION_TYPE", "wayland")],
            dir.path(),
        );
        assert!(matches!(
            wayland_fragment(&enforced),
            Err(PolicyError::DisplaySocketMissing(_))
        ));

        let relaxed = context_with(
            "waylandOnly=false\n",
            &[("XDG_SESSION_TYPE", "wayland")],
            dir.path(),
        );
        assert!(wayland_fragment(&relaxed).unwrap().is_empty());
    }

    #[test]
    fn x11_session_skips_wayland() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_with(
            "waylandOnly=true\n",
            &[("XDG_SESSION_TYPE", "x11")],
            dir.path(),
        );
        assert!(wayland_fragment(&ctx).unwrap().is_empty());
    }
}
