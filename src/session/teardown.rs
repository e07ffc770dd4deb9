//! Session teardown: stop units, remove per-instance state, remove the
//! desktop entry. Each step runs regardless of the others failing.

use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, info, warn};

use super::housekeeping::clean_stale_units;
use super::instance::ControlRecord;
use super::run_tool;
use crate::context::SessionContext;

/// Which teardown steps failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub units_failed: bool,
    pub dirs_failed: Vec<String>,
    pub desktop_entry_failed: bool,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        !self.units_failed && self.dirs_failed.is_empty() && !self.desktop_entry_failed
    }
}

/// Instance id of the session, recovered from the control record when this
/// process did not allocate it.
pub fn recover_instance_id(ctx: &SessionContext) -> Option<String> {
    if !ctx.instance_id.is_empty() {
        return Some(ctx.instance_id.clone());
    }
    let path = ctx.paths.control_file();
    match ControlRecord::read(&path) {
        Ok(record) => {
            debug!("Recovered instance ID {}", record.instance_id);
            Some(record.instance_id)
        }
        Err(e) => {
            warn!("Unable to read control file {}: {}", path.display(), e);
            None
        }
    }
}

fn remove_tree(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn remove_file(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

async fn stop_units(ctx: &SessionContext) -> bool {
    let mut ok = true;
    for unit in [
        format!("app-portable-{}.service", ctx.profile.app_id),
        format!("portable-{}.slice", ctx.profile.friendly_name),
    ] {
        let args = ["--user".to_string(), "stop".to_string(), unit.clone()];
        if let Err(e) = run_tool(&ctx.tools.systemctl, &args).await {
            debug!("Stopping {} failed: {}", unit, e);
            ok = false;
        }
    }
    clean_stale_units(ctx).await;
    ok
}

fn remove_state(ctx: &SessionContext) -> Vec<String> {
    let paths = &ctx.paths;
    let mut targets = Vec::new();
    // The record has to be read before the instance directory goes away.
    if let Some(id) = recover_instance_id(ctx) {
        targets.push(paths.flatpak_app_dir());
        targets.push(paths.instance_record_dir(&id));
    } else {
        debug!("Skipped cleaning Flatpak entries");
    }
    targets.extend([paths.instance_dir(), paths.bus_dir(), paths.a11y_dir()]);

    let mut failed = Vec::new();
    for target in targets {
        match remove_tree(&target) {
            Ok(()) => debug!("Removed directory {}", target.display()),
            Err(e) => {
                warn!("Unable to remove directory {}: {}", target.display(), e);
                failed.push(target.display().to_string());
            }
        }
    }
    failed
}

pub async fn teardown(ctx: &SessionContext) -> TeardownReport {
    info!("Cleaning leftovers");
    let dirs_failed = remove_state(ctx);
    let units_ok = stop_units(ctx).await;

    let entry = ctx.paths.desktop_entry();
    let desktop_entry_failed = match remove_file(&entry) {
        Ok(()) => false,
        Err(e) => {
            warn!("Unable to remove {}: {}", entry.display(), e);
            true
        }
    };

    TeardownReport {
        units_failed: !units_ok,
        dirs_failed,
        desktop_entry_failed,
    }
}
