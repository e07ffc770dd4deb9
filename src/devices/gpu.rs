//! GPU exposure.
//!
//! Cards are the `card*` entries of the DRM class directory. Entries with a
//! `-` in their name are connectors of a card and never count as cards.
//!
//! | cards | behaviour |
//! |---|---|
//! | 0 | warn, emit only the two masks |
//! | 1 (or forced) | bind the card(s) plus vendor accelerator nodes |
//! | >1, game mode | bind every card, set render offload variables |
//! | >1 | bind only cards with at least one connector not reporting "disconnected" |
//!
//! Cards with no connectors at all (render-only devices) count as inactive.

use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{DeviceResolver, sysfs_path};
use crate::context::{HostRoot, SessionContext};
use crate::policy::{BindMode, Directive, DirectiveList, Fragment};

const DRM_CLASS: &str = "/sys/class/drm";
const DRI_DEV: &str = "/dev/dri";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorStatus {
    Connected,
    Disconnected,
    Unknown,
}

impl ConnectorStatus {
    fn parse(raw: &str) -> Self {
        match raw.trim() {
            "connected" => Self::Connected,
            "disconnected" => Self::Disconnected,
            _ => Self::Unknown,
        }
    }
}

/// What is known about one card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCardInfo {
    pub name: String,
    /// Canonical sysfs device directory, once resolved.
    pub sysfs_path: Option<PathBuf>,
    /// Sibling render nodes (`renderD*`) found next to the card.
    pub render_nodes: Vec<String>,
    pub connectors: Vec<(String, ConnectorStatus)>,
}

impl DeviceCardInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sysfs_path: None,
            render_nodes: Vec::new(),
            connectors: Vec::new(),
        }
    }

    /// At least one connector reports something other than "disconnected".
    pub fn is_active(&self) -> bool {
        self.connectors
            .iter()
            .any(|(_, status)| *status != ConnectorStatus::Disconnected)
    }
}

/// Outcome of the decision table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuPlan {
    NoGpu,
    Single(Vec<String>),
    AllWithOffload(Vec<String>),
    ActiveSubset(Vec<String>),
}

impl GpuPlan {
    pub fn cards(&self) -> &[String] {
        match self {
            GpuPlan::NoGpu => &[],
            GpuPlan::Single(c) | GpuPlan::AllWithOffload(c) | GpuPlan::ActiveSubset(c) => c,
        }
    }
}

/// Apply the decision table. Exactly one row matches any inventory.
pub fn plan_gpus(cards: &[DeviceCardInfo], assume_single: bool, game_mode: bool) -> GpuPlan {
    let names = || cards.iter().map(|c| c.name.clone()).collect::<Vec<_>>();
    let count = if assume_single { 1 } else { cards.len() };
    match count {
        0 => GpuPlan::NoGpu,
        1 => GpuPlan::Single(names()),
        _ if game_mode => GpuPlan::AllWithOffload(names()),
        _ => GpuPlan::ActiveSubset(
            cards
                .iter()
                .filter(|c| c.is_active())
                .map(|c| c.name.clone())
                .collect(),
        ),
    }
}

/// Top-level card names under the DRM class directory.
pub fn enumerate_cards(root: &HostRoot) -> std::io::Result<Vec<String>> {
    Ok(root
        .list(DRM_CLASS)?
        .into_iter()
        .map(|e| e.name)
        .filter(|name| !name.contains('-') && name.starts_with("card"))
        .collect())
}

/// Read connector status files of a card.
pub fn probe_card(root: &HostRoot, card: &str) -> DeviceCardInfo {
    let mut info = DeviceCardInfo::new(card);
    let card_dir = Path::new(DRM_CLASS).join(card);
    let prefix = format!("{card}-");
    match root.list(&card_dir) {
        Ok(entries) => {
            for entry in entries.into_iter().filter(|e| e.name.starts_with(&prefix)) {
                let status_file = card_dir.join(&entry.name).join("status");
                let status = match root.read_to_string(&status_file) {
                    Ok(raw) => ConnectorStatus::parse(&raw),
                    Err(e) => {
                        warn!("Failed to read {}: {}", status_file.display(), e);
                        ConnectorStatus::Unknown
                    }
                };
                info.connectors.push((entry.name, status));
            }
        }
        Err(e) => warn!("Failed to read GPU connector status of {}: {}", card, e),
    }
    info
}

/// Resolve the card's sysfs device and its sibling render nodes.
pub fn resolve_card(
    root: &HostRoot,
    resolver: &dyn DeviceResolver,
    info: &mut DeviceCardInfo,
) -> bool {
    let class_entry = Path::new(DRM_CLASS).join(&info.name);
    let device = match resolver.device_path(&class_entry) {
        Ok(p) if !p.is_empty() => sysfs_path(&p),
        Ok(_) => {
            warn!("Device manager returned no path for GPU {}", info.name);
            return false;
        }
        Err(e) => {
            warn!("Failed to resolve GPU {}: {}", info.name, e);
            return false;
        }
    };

    let parent = device.parent().map(Path::to_path_buf).unwrap_or_default();
    debug!("GPU {} lives under {}", info.name, parent.display());
    match root.list(&parent) {
        Ok(entries) => {
            info.render_nodes = entries
                .into_iter()
                .map(|e| e.name)
                .filter(|n| n.starts_with("renderD"))
                .collect();
        }
        Err(e) => warn!("Failed to read {}: {}", parent.display(), e),
    }
    info.sysfs_path = Some(device);
    true
}

/// Directives exposing one resolved card.
pub fn card_directives(info: &DeviceCardInfo) -> DirectiveList {
    let mut list = DirectiveList::new();
    let Some(ref sysfs) = info.sysfs_path else {
        return list;
    };
    list.expose_device(sysfs)
        .expose_device(Path::new(DRM_CLASS).join(&info.name))
        .expose_device(Path::new(DRI_DEV).join(&info.name));
    for node in &info.render_nodes {
        list.expose_device(Path::new(DRI_DEV).join(node))
            .expose_device(Path::new(DRM_CLASS).join(node));
    }
    list
}

/// Vendor accelerator nodes (`/dev/nvidia*`).
fn vendor_nodes(root: &HostRoot) -> DirectiveList {
    match root.list("/dev") {
        Ok(entries) => entries
            .into_iter()
            .filter(|e| e.name.starts_with("nvidia"))
            .map(|e| {
                let path = Path::new("/dev").join(e.name);
                Directive::bind(BindMode::Device, path.clone(), path)
            })
            .collect(),
        Err(e) => {
            warn!("Failed to read /dev: {}", e);
            DirectiveList::new()
        }
    }
}

/// Render offload variables for multi-GPU game mode.
fn offload_env(root: &HostRoot) -> Vec<String> {
    let mut env = vec!["VK_LOADER_DRIVERS_DISABLE=none".to_string()];
    if root.exists("/dev/nvidia0") {
        env.extend(
            [
                "__NV_PRIME_RENDER_OFFLOAD=1",
                "__VK_LAYER_NV_optimus=NVIDIA_only",
                "__GLX_VENDOR_LIBRARY_NAME=nvidia",
                "VK_LOADER_DRIVERS_SELECT=nvidia_icd.json",
            ]
            .map(String::from),
        );
    } else {
        env.push("DRI_PRIME=1".to_string());
    }
    env
}

pub fn gpu_fragment(ctx: &SessionContext, resolver: &dyn DeviceResolver) -> Fragment {
    let root = &ctx.root;
    let mut fragment = Fragment::new("gpu");
    fragment.directives.tmpfs(DRI_DEV).tmpfs(DRM_CLASS);

    let names = enumerate_cards(root).unwrap_or_else(|e| {
        warn!("Unable to parse GPU information: {}", e);
        Vec::new()
    });
    let mut cards: Vec<DeviceCardInfo> = names.iter().map(|n| probe_card(root, n)).collect();

    let plan = plan_gpus(
        &cards,
        ctx.env.is_set("PORTABLE_ASSUME_SINGLE_GPU"),
        ctx.profile.game_mode,
    );

    match plan {
        GpuPlan::NoGpu => {
            warn!("Found no GPU");
            return fragment;
        }
        GpuPlan::Single(_) => {
            fragment.directives.append(vendor_nodes(root));
        }
        GpuPlan::AllWithOffload(_) => {
            fragment.env.extend(offload_env(root));
            fragment.directives.append(vendor_nodes(root));
        }
        GpuPlan::ActiveSubset(_) => {}
    }

    let selected = plan.cards();
    for card in cards.iter_mut().filter(|c| selected.contains(&c.name)) {
        if resolve_card(root, resolver, card) {
            fragment.directives.append(card_directives(card));
        }
    }
    debug!(
        "Found {} GPU(s), identified active: {}",
        names.len(),
        selected.join(", ")
    );
    fragment
}
