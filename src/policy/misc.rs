//! Flatpak compatibility binds, host tool overlays and theme passthrough.

use std::path::PathBuf;

use super::Fragment;
use crate::context::SessionContext;

const FLATPAK_SPAWN: &str = "/usr/lib/flatpak-xdg-utils/flatpak-spawn";
const FLATPAK_SPAWN_OVERLAY: &str = "/usr/lib/portable/overlay-usr/flatpak-spawn";

/// Theme and font locations relative to the user's config directory.
const CONFIG_THEMES: &[&str] = &[
    "fontconfig",
    "gtk-3.0/gtk.css",
    "gtk-3.0/colors.css",
    "gtk-4.0/gtk.css",
    "qt6ct",
];

/// Relative to the user's data directory.
const DATA_THEMES: &[&str] = &["fonts", "icons"];

pub fn misc_fragment(ctx: &SessionContext) -> Fragment {
    let mut fragment = Fragment::new("misc");
    let d = &mut fragment.directives;
    let runtime = ctx.runtime();
    let sandbox_home = ctx.sandbox_home();

    if ctx.profile.mount_info {
        let record = ctx.paths.instance_record_dir(&ctx.instance_id);
        let info = ctx.paths.flatpak_info();
        d.ro_bind(
            "/dev/null",
            ctx.paths
                .flatpak_root()
                .join(format!("{}-private", ctx.instance_id))
                .join("run-environ"),
        )
        .ro_bind(&record, &record)
        .ro_bind(&record, runtime.join("flatpak-runtime-directory"))
        .ro_bind(&info, "/.flatpak-info")
        .ro_bind(&info, runtime.join(".flatpak-info"))
        .ro_bind(&info, sandbox_home.join(".flatpak-info"))
        .tmpfs(ctx.home.join(".var"))
        .tmpfs(sandbox_home.join(".var"));
        let var_app = sandbox_home.join(".var/app").join(&ctx.profile.app_id);
        d.rw_bind(&sandbox_home, &var_app)
            .tmpfs(var_app.join("options"));
    }

    if ctx.root.exists(FLATPAK_SPAWN) {
        d.ro_bind(FLATPAK_SPAWN_OVERLAY, FLATPAK_SPAWN);
    }

    if ctx.root.is_dir("/etc/kernel") {
        d.tmpfs("/etc/kernel");
    }

    let data_home = &ctx.paths.data_home;
    let sources = CONFIG_THEMES
        .iter()
        .map(|rel| ctx.config_home.join(rel))
        .chain(DATA_THEMES.iter().map(|rel| data_home.join(rel)))
        .collect::<Vec<PathBuf>>();
    for source in sources {
        let dest = ctx.translate_path(&source);
        d.ro_bind_try(source, dest);
    }

    fragment
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::context_with;
    use crate::policy::{BindMode, Directive};
    use std::fs;

    #[test]
    fn flatpak_info_bound_when_mount_info() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_with("", &[], dir.path());
        let fragment = misc_fragment(&ctx);
        assert_eq!(
            fragment.directives.effective("/.flatpak-info"),
            Some(&Directive::bind(
                BindMode::ReadOnly,
                "/run/user/1000/portable/top.kimiblock.test/flatpak-info",
                "/.flatpak-info"
            ))
        );
        assert!(
            fragment
                .directives
                .effective("/run/user/1000/.flatpak/1234567")
                .is_some()
        );
    }

    #[test]
    fn no_flatpak_binds_without_mount_info() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_with("mountInfo=false\n", &[], dir.path());
        let fragment = misc_fragment(&ctx);
        assert!(fragment.directives.effective("/.flatpak-info").is_none());
    }

    #[test]
    fn host_probes_add_overlay_and_kernel_mask() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("usr/lib/flatpak-xdg-utils")).unwrap();
        fs::write(dir.path().join("usr/lib/flatpak-xdg-utils/flatpak-spawn"), "").unwrap();
        fs::create_dir_all(dir.path().join("etc/kernel")).unwrap();
        let ctx = context_with("", &[], dir.path());
        let fragment = misc_fragment(&ctx);
        assert!(fragment.directives.effective(FLATPAK_SPAWN).is_some());
        assert!(matches!(
            fragment.directives.effective("/etc/kernel"),
            Some(Directive::Tmpfs { .. })
        ));
    }

    #[test]
    fn themes_translated_into_sandbox_home() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_with("", &[], dir.path());
        let fragment = misc_fragment(&ctx);
        assert_eq!(
            fragment
                .directives
                .effective("/home/alice/.local/share/Test_Data/.config/qt6ct"),
            Some(&Directive::bind_try(
                BindMode::ReadOnly,
                "/home/alice/.config/qt6ct",
                "/home/alice/.local/share/Test_Data/.config/qt6ct"
            ))
        );
    }
}
