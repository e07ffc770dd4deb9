//! Base sandbox layout: namespace unshares, masks over sensitive host paths,
//! proc and sysfs restrictions, and the runtime, bus and home binds every
//! session needs.

use std::path::Path;

use super::directive::DirectiveList;
use crate::context::SessionContext;

/// Private marker directory used by in-sandbox tooling to detect the sandbox.
pub const SANDBOX_MARKER: &str = "/top.kimiblock.portable";

/// Files under /proc replaced by /dev/null.
const PROC_MASKS: &[&str] = &[
    "uptime",
    "modules",
    "cmdline",
    "diskstats",
    "devices",
    "config.gz",
    "mounts",
    "loadavg",
    "filesystems",
];

const HIDDEN_ROOTS: &[&str] = &["/boot", "/srv", "/root", "/media", "/mnt"];

const VAR_TMPFS: &[&str] = &[
    "/var/empty",
    "/var/lib",
    "/var/log",
    "/var/opt",
    "/var/spool",
    "/var/tmp",
];

pub fn skeleton(ctx: &SessionContext) -> DirectiveList {
    let paths = &ctx.paths;
    let runtime = ctx.runtime();
    let instance = paths.instance_dir();
    let sandbox_home = ctx.sandbox_home();

    let mut list = DirectiveList::new();
    list.flag("--new-session")
        .flag("--unshare-cgroup-try")
        .flag("--unshare-ipc")
        .flag("--unshare-uts")
        .flag("--unshare-pid")
        .flag("--unshare-user");

    list.tmpfs("/tmp");

    // /dev
    list.dev("/dev")
        .tmpfs("/dev/shm")
        .dev_bind_try("/dev/mali", "/dev/mali")
        .dev_bind_try("/dev/mali0", "/dev/mali0")
        .dev_bind_try("/dev/umplock", "/dev/umplock")
        .mqueue("/dev/mqueue")
        .dev_bind("/dev/dri", "/dev/dri")
        .dev_bind_try("/dev/udmabuf", "/dev/udmabuf")
        .dev_bind_try("/dev/ntsync", "/dev/ntsync")
        .dir(SANDBOX_MARKER);

    // sysfs
    list.tmpfs("/sys")
        .ro_bind_try("/sys/module", "/sys/module")
        .ro_bind_try("/sys/dev/char", "/sys/dev/char")
        .tmpfs("/sys/devices")
        .ro_bind_try("/sys/fs/cgroup", "/sys/fs/cgroup")
        .dev_bind("/sys/class/drm", "/sys/class/drm")
        .rw_bind_try("/sys/devices/system", "/sys/devices/system")
        .ro_bind("/sys/kernel", "/sys/kernel");

    // /usr and the merged-usr symlinks
    list.rw_bind("/usr", "/usr")
        .overlay(
            vec!["/usr/bin".into(), "/usr/lib/portable/overlay-usr".into()],
            "/usr/bin",
        )
        .symlink("/usr/lib", "/lib")
        .symlink("/usr/lib", "/lib64")
        .symlink("/usr/bin", "/bin")
        .symlink("/usr/bin", "/sbin");

    list.proc("/proc").dev_bind_try("/dev/null", "/dev/null");
    for name in PROC_MASKS {
        list.ro_bind_try("/dev/null", Path::new("/proc").join(name));
    }

    for dir in HIDDEN_ROOTS {
        list.tmpfs_with_perms(*dir, 0o000);
    }
    list.tmpfs("/home")
        .tmpfs("/var")
        .symlink("/run", "/var/run")
        .symlink("/run/lock", "/var/lock");
    for dir in VAR_TMPFS {
        list.tmpfs(*dir);
    }
    list.ro_bind_try("/opt", "/opt")
        .ro_bind_try("/var/cache/fontconfig", "/var/cache/fontconfig");

    // /run and the runtime directory
    list.rw_bind(&instance, "/run")
        .rw_bind(&instance, &instance)
        .ro_bind_try(
            "/run/systemd/userdb/io.systemd.Home",
            "/run/systemd/userdb/io.systemd.Home",
        )
        .ro_bind(paths.bus_socket(), "/run/sessionBus")
        .ro_bind_try(paths.a11y_dir(), runtime.join("at-spi"))
        .dir("/run/host")
        .rw_bind(paths.document_dir(), runtime.join("doc"))
        .ro_bind_try(
            "/run/systemd/resolve/stub-resolv.conf",
            "/run/systemd/resolve/stub-resolv.conf",
        )
        .rw_bind(runtime.join("systemd/notify"), runtime.join("systemd/notify"))
        .ro_bind_try(runtime.join("pulse"), runtime.join("pulse"));

    // home
    list.rw_bind(&sandbox_home, &ctx.home)
        .rw_bind(&sandbox_home, &sandbox_home)
        .ro_bind("/etc", "/etc");

    // privacy masks
    list.tmpfs("/proc/1")
        .tmpfs("/usr/share/applications")
        .tmpfs(ctx.home.join("options"))
        .tmpfs(sandbox_home.join("options"));

    list
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::context_with;
    use crate::policy::directive::{BindMode, Directive};

    #[test]
    fn starts_with_namespace_flags() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_with("", &[], dir.path());
        let list = skeleton(&ctx);
        let flags: Vec<_> = list
            .iter()
            .take_while(|d| matches!(d, Directive::Flag(_)))
            .collect();
        assert_eq!(flags.len(), 6);
        assert_eq!(flags[0], &Directive::Flag("--new-session"));
    }

    #[test]
    fn home_is_redirected_to_state_directory() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_with("", &[], dir.path());
        let list = skeleton(&ctx);
        assert_eq!(
            list.effective("/home/alice"),
            Some(&Directive::bind(
                BindMode::ReadWrite,
                "/home/alice/.local/share/Test_Data",
                "/home/alice"
            ))
        );
        assert_eq!(
            list.effective("/run/sessionBus"),
            Some(&Directive::bind(
                BindMode::ReadOnly,
                "/run/user/1000/app/top.kimiblock.test/bus",
                "/run/sessionBus"
            ))
        );
    }

    #[test]
    fn sensitive_roots_are_hidden() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_with("", &[], dir.path());
        let list = skeleton(&ctx);
        assert_eq!(
            list.effective("/root"),
            Some(&Directive::Tmpfs {
                dest: "/root".into(),
                perms: Some(0)
            })
        );
        assert!(matches!(
            list.effective("/proc/cmdline"),
            Some(Directive::Bind { optional: true, .. })
        ));
    }
}
