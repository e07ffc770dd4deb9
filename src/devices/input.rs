//! Input device and camera exposure.

use std::path::Path;
use tracing::{debug, warn};

use super::{DeviceResolver, sysfs_path};
use crate::context::{HostRoot, SessionContext};
use crate::policy::Fragment;

const INPUT_CLASSES: &[&str] = &[
    "/sys/class/leds",
    "/sys/class/input",
    "/sys/class/hidraw",
    "/dev/input",
    "/dev/uinput",
];

/// Input devices: hidraw nodes plus evdev and joystick nodes, each with its
/// sysfs device directory.
pub fn input_fragment(ctx: &SessionContext, resolver: &dyn DeviceResolver) -> Fragment {
    let mut fragment = Fragment::new("input");
    if !ctx.profile.bind_input_devices {
        return fragment;
    }
    for class in INPUT_CLASSES {
        fragment.directives.dev_bind_try(*class, *class);
    }

    let mut nodes = Vec::new();
    collect(&ctx.root, "/dev", |name, _| name.starts_with("hidraw"), &mut nodes);
    collect(
        &ctx.root,
        "/dev/input",
        |name, is_dir| !is_dir && (name.starts_with("event") || name.starts_with("js")),
        &mut nodes,
    );

    for node in nodes {
        debug!("Detected input device {}", node.display());
        fragment.directives.expose_device(&node);
        match resolver.device_path(&node) {
            Ok(path) if !path.is_empty() => {
                fragment.directives.expose_device(sysfs_path(&path));
            }
            Ok(_) => warn!("No sysfs path for {}", node.display()),
            Err(e) => warn!("Unable to resolve device path of {}: {}", node.display(), e),
        }
    }
    fragment
}

/// Every non-directory `/dev/video*` node.
pub fn camera_fragment(ctx: &SessionContext) -> Fragment {
    let mut fragment = Fragment::new("camera");
    if !ctx.profile.bind_cameras {
        return fragment;
    }
    let mut nodes = Vec::new();
    collect(
        &ctx.root,
        "/dev",
        |name, is_dir| !is_dir && name.starts_with("video"),
        &mut nodes,
    );
    if nodes.is_empty() {
        debug!("No camera found");
    }
    for node in nodes {
        fragment.directives.expose_device(node);
    }
    fragment
}

fn collect(
    root: &HostRoot,
    dir: &str,
    keep: impl Fn(&str, bool) -> bool,
    out: &mut Vec<std::path::PathBuf>,
) {
    match root.list(dir) {
        Ok(entries) => out.extend(
            entries
                .into_iter()
                .filter(|e| keep(&e.name, e.is_dir))
                .map(|e| Path::new(dir).join(e.name)),
        ),
        Err(e) => warn!("Could not read {}: {}", dir, e),
    }
}
