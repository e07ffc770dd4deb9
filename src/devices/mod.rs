//! Host device enumeration: GPUs, input devices and cameras.
//!
//! Canonical sysfs locations come from the device manager through
//! [`DeviceResolver`], so tests can substitute a mock.

pub mod gpu;
pub mod input;

use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

pub use gpu::{DeviceCardInfo, GpuPlan, gpu_fragment, plan_gpus};
pub use input::{camera_fragment, input_fragment};

/// Resolves a device node or class entry to its sysfs device path.
#[cfg_attr(test, mockall::automock)]
pub trait DeviceResolver: Send + Sync {
    /// Device path as reported by the device manager, relative to /sys
    /// (e.g. `/devices/pci0000:00/0000:00:02.0/drm/card0`).
    fn device_path(&self, node: &Path) -> io::Result<String>;
}

/// `udevadm info --query=path`.
#[derive(Debug, Clone)]
pub struct Udevadm {
    program: String,
}

impl Udevadm {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl DeviceResolver for Udevadm {
    fn device_path(&self, node: &Path) -> io::Result<String> {
        let output = Command::new(&self.program)
            .arg("info")
            .arg(node)
            .arg("--query=path")
            .output()?;
        if !output.status.success() {
            return Err(io::Error::other(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!("Resolved {} to {}", node.display(), path);
        Ok(path)
    }
}

/// Absolute sysfs path for a resolved device path.
pub(crate) fn sysfs_path(device_path: &str) -> PathBuf {
    Path::new("/sys").join(device_path.trim_start_matches('/'))
}
