//! Message-bus filter rules.
//!
//! The rule list is a pure function of the app id, the capability flags and
//! the optional MPRIS name override.

use std::fmt;

const PORTAL: &str = "org.freedesktop.portal.Desktop";
const MPRIS_PREFIX: &str = "org.mpris.MediaPlayer2";

/// Portal interfaces callable on the desktop portal, each with its members.
const PORTAL_INTERFACES: &[&str] = &[
    "Screenshot",
    "Email",
    "Usb",
    "PowerProfileMonitor",
    "MemoryMonitor",
    "ProxyResolver.Lookup",
    "ScreenCast",
    "Account.GetUserInformation",
    "Camera",
    "RemoteDesktop",
    "Documents",
    "Device",
    "FileChooser",
    "FileTransfer",
    "Notification",
    "Print",
    "NetworkMonitor",
    "OpenURI",
    "Fcitx",
    "IBus",
    "Secret",
];

/// Services the app may talk to and call freely.
const TALK_DESTINATIONS: &[&str] = &[
    "org.freedesktop.portal.Documents",
    "org.freedesktop.portal.FileTransfer",
    "org.freedesktop.portal.Notification",
    "org.freedesktop.portal.Print",
    "org.freedesktop.FileManager1",
    "org.freedesktop.portal.Fcitx",
    "org.freedesktop.portal.IBus",
];

/// Tray item names are owned one per process by most hosts, so a range is
/// reserved for apps that spawn several.
pub const TRAY_NAME_RANGE: std::ops::Range<u32> = 2..30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusOp {
    Own,
    Talk,
    Call,
    See,
    Broadcast,
}

impl fmt::Display for BusOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BusOp::Own => "own",
            BusOp::Talk => "talk",
            BusOp::Call => "call",
            BusOp::See => "see",
            BusOp::Broadcast => "broadcast",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BusRule {
    pub op: BusOp,
    pub pattern: String,
}

impl BusRule {
    pub fn new(op: BusOp, pattern: impl Into<String>) -> Self {
        Self {
            op,
            pattern: pattern.into(),
        }
    }

    /// Proxy command line form, e.g. `--own=org.example.App`.
    pub fn to_arg(&self) -> String {
        format!("--{}={}", self.op, self.pattern)
    }
}

impl fmt::Display for BusRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_arg())
    }
}

/// Capability switches that change the rule set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusFlags {
    pub classic_notifications: bool,
    pub inhibit: bool,
    pub global_shortcuts: bool,
    /// The desktop offers the location portal (GNOME).
    pub location: bool,
}

struct Rules(Vec<BusRule>);

impl Rules {
    fn add(&mut self, op: BusOp, pattern: impl Into<String>) -> &mut Self {
        self.0.push(BusRule::new(op, pattern));
        self
    }

    fn portal_call(&mut self, interface: &str) -> &mut Self {
        self.add(BusOp::Call, format!("{PORTAL}=org.freedesktop.portal.{interface}"))
    }

    /// Interface and every member below it.
    fn portal_interface(&mut self, interface: &str) -> &mut Self {
        self.portal_call(interface)
            .portal_call(&format!("{interface}.*"))
    }

    fn own_with_children(&mut self, name: &str) -> &mut Self {
        self.add(BusOp::Own, name).add(BusOp::Own, format!("{name}.*"))
    }
}

pub fn build_rules(app_id: &str, flags: &BusFlags, mpris_override: Option<&str>) -> Vec<BusRule> {
    let mut rules = Rules(Vec::with_capacity(128));

    rules
        .add(BusOp::Talk, "org.unifiedpush.Distributor.*")
        .own_with_children(app_id)
        .add(BusOp::Talk, "org.kde.StatusNotifierWatcher")
        .add(BusOp::Talk, "com.canonical.AppMenu.Registrar")
        .add(BusOp::See, "org.a11y.Bus")
        .add(BusOp::Call, "org.a11y.Bus=org.a11y.Bus.GetAddress@/org/a11y/bus")
        .add(
            BusOp::Call,
            "org.a11y.Bus=org.freedesktop.DBus.Properties.Get@/org/a11y/bus",
        )
        .portal_call("Screenshot")
        .portal_call("Screenshot.Screenshot")
        .add(BusOp::See, "org.freedesktop.portal.Request")
        .add(BusOp::Call, format!("{PORTAL}=org.freedesktop.DBus.Properties.GetAll"))
        .portal_call("Session.Close")
        .portal_call("Settings.ReadAll")
        .portal_call("Settings.Read")
        .portal_call("Request")
        .add(
            BusOp::Call,
            format!("{PORTAL}=org.freedesktop.DBus.Properties.Get@/org/freedesktop/portal/desktop"),
        )
        .add(BusOp::Call, "org.freedesktop.portal.Request=*")
        .add(
            BusOp::Broadcast,
            "org.freedesktop.portal.*=@/org/freedesktop/portal/*",
        );

    for interface in PORTAL_INTERFACES {
        rules.portal_interface(interface);
    }
    for dest in TALK_DESTINATIONS {
        rules
            .add(BusOp::Talk, *dest)
            .add(BusOp::Call, format!("{dest}=*"));
    }

    if flags.location {
        rules.portal_interface("Location");
    }
    if flags.classic_notifications {
        rules
            .add(BusOp::Talk, "org.freedesktop.Notifications")
            .add(BusOp::Call, "org.freedesktop.Notifications.*=*");
    }
    if flags.inhibit {
        rules.portal_interface("Inhibit");
    }
    if flags.global_shortcuts {
        rules.portal_interface("GlobalShortcuts");
    }

    let short = app_id.rsplit('.').next().unwrap_or(app_id);
    rules
        .own_with_children(&format!("{MPRIS_PREFIX}.{app_id}"))
        .own_with_children(&format!("{MPRIS_PREFIX}.{short}"));
    if let Some(name) = mpris_override.filter(|n| !n.is_empty()) {
        rules.own_with_children(&format!("{MPRIS_PREFIX}.{name}"));
    }

    for i in TRAY_NAME_RANGE {
        rules.add(BusOp::Own, format!("org.kde.StatusNotifierItem-{i}-1"));
    }

    rules.0
}
