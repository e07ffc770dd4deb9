//! Best-effort host preparation before a session starts.

use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

use super::run_tool;
use crate::context::SessionContext;

const DESKTOP_STUB: &str = "[Desktop Entry]
Name=placeholderName
Exec=env _portableConfig=placeholderConfig portable
Terminal=false
Type=Application
Icon=image-missing
Comment=Application info missing
";

/// Unit name patterns owned by this app.
pub fn unit_patterns(ctx: &SessionContext) -> [String; 2] {
    [
        format!("{}*", ctx.profile.friendly_name),
        format!("app-portable-{}*", ctx.profile.app_id),
    ]
}

/// Kill, reset and clean units left by a previous run.
pub async fn clean_stale_units(ctx: &SessionContext) {
    let patterns = unit_patterns(ctx);
    for verb in ["kill", "reset-failed", "clean"] {
        let mut args = vec!["--user".to_string(), verb.to_string()];
        args.extend(patterns.iter().cloned());
        if let Err(e) = run_tool(&ctx.tools.systemctl, &args).await {
            debug!("systemctl {} skipped: {}", verb, e);
        }
    }
}

pub fn render_desktop_stub(app_id: &str, profile: &Path) -> String {
    DESKTOP_STUB
        .replace("placeholderName", app_id)
        .replace("placeholderConfig", &profile.to_string_lossy())
}

/// Install a stub desktop entry unless the system ships one.
///
/// Returns whether a stub was written.
pub fn install_desktop_stub(ctx: &SessionContext) -> bool {
    let system = Path::new("/usr/share/applications").join(format!("{}.desktop", ctx.profile.app_id));
    if ctx.root.exists(&system) {
        debug!(".desktop file detected at {}", system.display());
        return false;
    }
    let target = ctx.paths.desktop_entry();
    let result = target
        .parent()
        .map_or(Ok(()), fs::create_dir_all)
        .and_then(|()| {
            fs::write(
                &target,
                render_desktop_stub(&ctx.profile.app_id, &ctx.profile.source),
            )
        });
    match result {
        Ok(()) => {
            warn!("You should supply your own .desktop file");
            true
        }
        Err(e) => {
            warn!("Unable to install desktop entry {}: {}", target.display(), e);
            false
        }
    }
}

/// Ask the permission store to let the app run in the background.
pub async fn grant_background(ctx: &SessionContext) {
    debug!("Unrestricting background limits");
    let args = [
        "--session".to_string(),
        "--print-reply".to_string(),
        "--dest=org.freedesktop.impl.portal.PermissionStore".to_string(),
        "/org/freedesktop/impl/portal/PermissionStore".to_string(),
        "org.freedesktop.impl.portal.PermissionStore.SetPermission".to_string(),
        "string:background".to_string(),
        "boolean:true".to_string(),
        "string:background".to_string(),
        format!("string:{}", ctx.profile.app_id),
        "array:string:yes".to_string(),
    ];
    match run_tool(&ctx.tools.dbus_send, &args).await {
        Ok(()) => info!("Background permission granted"),
        Err(e) => warn!(
            "Failed to set background permission, the app may be terminated by the desktop: {}",
            e
        ),
    }
}
