//! Flatpak compatibility record, so portals treat the app as sandboxed.

use std::fs;
use tracing::debug;

use crate::context::SessionContext;
use crate::error::SessionError;
use crate::paths::create_dir_with_mode;

pub const BUILTIN_TEMPLATE: &str = "[Application]
name=placeHolderAppName
runtime=runtime/placeHolderAppName/x86_64/portable

[Instance]
instance-id=placeholderInstanceId
app-path=placeholderPath
runtime-path=/usr
session-bus-proxy=true
system-bus-proxy=false

[Context]
shared=network;ipc;
sockets=x11;wayland;pulseaudio;
";

pub fn render(template: &str, app_id: &str, instance_id: &str, app_path: &str) -> String {
    template
        .replace("placeHolderAppName", app_id)
        .replace("placeholderInstanceId", instance_id)
        .replace("placeholderPath", app_path)
}

/// Rendered record for this session. Falls back to the built-in template
/// when the configured one is unreadable.
pub fn render_for(ctx: &SessionContext) -> String {
    let template_path = &ctx.tools.flatpak_info_template;
    let template = fs::read_to_string(template_path).unwrap_or_else(|e| {
        debug!(
            "Using built-in flatpak-info, {} unreadable: {}",
            template_path.display(),
            e
        );
        BUILTIN_TEMPLATE.to_string()
    });
    render(
        &template,
        &ctx.profile.app_id,
        &ctx.instance_id,
        &ctx.sandbox_home().to_string_lossy(),
    )
}

/// Write the record next to the instance state and into the claimed
/// instance directory, and lay out the per-app flatpak directories.
pub fn install(ctx: &SessionContext) -> Result<(), SessionError> {
    let paths = &ctx.paths;
    let info = render_for(ctx);

    create_dir_with_mode(&paths.instance_dir(), 0o700)?;
    fs::write(paths.flatpak_info(), &info)?;

    let record_dir = paths.instance_record_dir(&ctx.instance_id);
    create_dir_with_mode(&record_dir, 0o700)?;
    fs::write(record_dir.join("info"), &info)?;

    let app_dir = paths.flatpak_app_dir();
    create_dir_with_mode(&app_dir.join("xdg-run"), 0o700)?;
    create_dir_with_mode(&app_dir.join("tmp"), 0o700)?;
    fs::write(app_dir.join(".ref"), "")?;
    Ok(())
}
