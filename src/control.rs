//! Control channel between the in-sandbox helper and the launcher.
//!
//! Messages are newline-terminated ASCII tokens sent over a local stream
//! socket, one message per connection.

use std::fmt;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

use crate::error::SessionError;

/// Launcher socket as seen from inside the sandbox.
pub const SANDBOX_CONTROL_SOCKET: &str = "/run/portable-control/daemon";

/// Helper service socket as seen from inside the sandbox.
pub const SANDBOX_HELPER_SOCKET: &str = "/run/portable-control/helper";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Every tracked process has exited.
    TerminateNow,
}

impl ControlMessage {
    pub fn token(&self) -> &'static str {
        match self {
            ControlMessage::TerminateNow => "terminate-now",
        }
    }

    pub fn encode(&self) -> String {
        format!("{}\n", self.token())
    }

    pub fn parse(line: &str) -> Result<Self, SessionError> {
        match line.trim_end_matches(['\n', '\r']) {
            "terminate-now" => Ok(ControlMessage::TerminateNow),
            other => Err(SessionError::UnknownControlMessage(other.to_string())),
        }
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Launcher end of the channel. The socket file is removed on drop.
#[derive(Debug)]
pub struct ControlListener {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlListener {
    /// Bind at `path`, replacing a stale socket left by a previous run.
    pub fn bind(path: &Path) -> Result<Self, SessionError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::remove_file(path) {
            Ok(()) => debug!("Removed stale control socket {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let listener = UnixListener::bind(path)?;
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the next well-formed message. Malformed messages are logged
    /// and skipped.
    pub async fn recv(&self) -> Result<ControlMessage, SessionError> {
        loop {
            let (stream, _) = self.listener.accept().await?;
            let mut line = String::new();
            if BufReader::new(stream).read_line(&mut line).await? == 0 {
                debug!("Control connection closed without a message");
                continue;
            }
            match ControlMessage::parse(&line) {
                Ok(message) => return Ok(message),
                Err(e) => warn!("{}", e),
            }
        }
    }
}

impl Drop for ControlListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Deliver one message to the listener at `path`.
pub async fn send(path: &Path, message: ControlMessage) -> Result<(), SessionError> {
    let mut stream = UnixStream::connect(path).await?;
    stream.write_all(message.encode().as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}
