//! Service-manager readiness and status notifications.

use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Ready,
    /// Reload started at the given `CLOCK_MONOTONIC` time in microseconds.
    Reloading(u64),
    Status(usize),
    Stopping,
}

impl Notification {
    pub fn render(&self) -> String {
        match self {
            Notification::Ready => "READY=1".to_string(),
            Notification::Reloading(usec) => format!("RELOADING=1\nMONOTONIC_USEC={usec}"),
            Notification::Status(n) => format!("STATUS=Tracking processes: {n}"),
            Notification::Stopping => "STOPPING=1".to_string(),
        }
    }
}

/// Current `CLOCK_MONOTONIC` in microseconds.
pub fn monotonic_usec() -> io::Result<u64> {
    use nix::time::{ClockId, clock_gettime};
    let now = clock_gettime(ClockId::CLOCK_MONOTONIC).map_err(io::Error::from)?;
    Ok(now.tv_sec() as u64 * 1_000_000 + now.tv_nsec() as u64 / 1_000)
}

/// Datagram sender for `$NOTIFY_SOCKET`; a no-op when the variable is unset.
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    socket: Option<String>,
}

impl Notifier {
    pub fn new(socket: Option<String>) -> Self {
        Self {
            socket: socket.filter(|s| !s.is_empty()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.socket.is_some()
    }

    /// Send one notification. Returns `Ok(false)` when notifications are not
    /// supported in this environment.
    pub fn send(&self, notification: &Notification) -> io::Result<bool> {
        let Some(target) = &self.socket else {
            return Ok(false);
        };
        let socket = UnixDatagram::unbound()?;
        let payload = notification.render();
        match target.strip_prefix('@') {
            Some(name) => {
                use std::os::linux::net::SocketAddrExt;
                let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
                socket.send_to_addr(payload.as_bytes(), &addr)?;
            }
            None => {
                socket.send_to(payload.as_bytes(), PathBuf::from(target))?;
            }
        }
        debug!("Notified service manager: {}", payload);
        Ok(true)
    }
}
