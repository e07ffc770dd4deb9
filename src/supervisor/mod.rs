//! In-sandbox session helper.
//!
//! Starts the main application, serves auxiliary spawn requests and tracks
//! how many processes are alive. When the count drains to zero it tells the
//! launcher to tear the session down, then exits with the main
//! application's code.

pub mod counter;
pub mod notify;
pub mod service;
pub mod table;
pub mod target;

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub use counter::{CountEvent, CounterHandle, Phase, Publish, run_counter};
pub use notify::{Notification, Notifier, monotonic_usec};
pub use service::{ServiceState, StartRequest, StartResponse};
pub use table::{Claim, ProcessRecord, ProcessTable};
pub use target::{PassFiles, TargetPlan};

use crate::context::HostEnv;
use crate::control::{self, ControlMessage, SANDBOX_CONTROL_SOCKET, SANDBOX_HELPER_SOCKET};
use crate::error::SupervisorError;
use crate::session::{exit_code, run_tool};

const NOTIFICATION_TOOL: &str = "gdbus";

/// GVariant text-format string literal.
fn gvariant_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\'' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('\'');
    out
}

/// Desktop notification through the portal when the network filter could
/// not be applied. Best-effort.
async fn notify_netsock_failure(message: String) {
    let options = format!(
        "{{'title': <'Failed to apply firewall'>, 'body': <{}>, 'priority': <'urgent'>}}",
        gvariant_str(&message)
    );
    let args = [
        "call",
        "--session",
        "--dest",
        "org.freedesktop.portal.Desktop",
        "--object-path",
        "/org/freedesktop/portal/desktop",
        "--method",
        "org.freedesktop.portal.Notification.AddNotification",
        "'2147483647'",
    ]
    .into_iter()
    .map(String::from)
    .chain([options])
    .collect::<Vec<_>>();
    if let Err(e) = run_tool(NOTIFICATION_TOOL, &args).await {
        warn!("Failed to send notification: {}", e);
    }
}

/// Unit signals handled while the main application runs.
struct UnitSignals {
    terminate: Signal,
    reload: Signal,
}

enum UnitEvent {
    Terminate,
    Reload,
}

impl UnitSignals {
    fn install() -> io::Result<Self> {
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            reload: signal(SignalKind::alarm())?,
        })
    }

    async fn next(signals: &mut Option<UnitSignals>) -> UnitEvent {
        let Some(s) = signals else {
            return std::future::pending().await;
        };
        tokio::select! {
            Some(()) = s.terminate.recv() => UnitEvent::Terminate,
            Some(()) = s.reload.recv() => UnitEvent::Reload,
            else => std::future::pending().await,
        }
    }
}

fn forward_terminate(pid: Option<u32>) {
    use nix::sys::signal::{Signal as NixSignal, kill};
    use nix::unistd::Pid;
    let Some(pid) = pid else {
        return;
    };
    match kill(Pid::from_raw(pid as i32), NixSignal::SIGTERM) {
        Ok(()) => info!("Forwarded termination request to main application"),
        Err(e) => warn!("Could not forward termination request: {}", e),
    }
}

fn acknowledge_reload(notifier: &Notifier) {
    let result = monotonic_usec()
        .and_then(|usec| notifier.send(&Notification::Reloading(usec)))
        .and_then(|_| notifier.send(&Notification::Ready));
    if let Err(e) = result {
        warn!("Failed to acknowledge reload: {}", e);
    }
}

/// Run the main application in the foreground. The caller has already
/// posted its +1; the matching -1 is posted here on every path.
async fn run_main(
    cmdline: &[String],
    counter: &CounterHandle,
    notifier: &Notifier,
    mut signals: Option<UnitSignals>,
) -> Result<i32, SupervisorError> {
    let Some((program, args)) = cmdline.split_first() else {
        counter.exited();
        return Err(SupervisorError::EmptyTarget);
    };
    info!("Starting main application {} with cmdline: {:?}", program, args);
    let spawned = Command::new(program)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(source) => {
            counter.exited();
            return Err(SupervisorError::Spawn {
                command: cmdline.join(" "),
                source,
            });
        }
    };
    if let Err(e) = notifier.send(&Notification::Ready) {
        warn!("Failed to notify readiness: {}", e);
    }
    let pid = child.id();
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            event = UnitSignals::next(&mut signals) => match event {
                UnitEvent::Terminate => forward_terminate(pid),
                UnitEvent::Reload => acknowledge_reload(notifier),
            },
        }
    };
    counter.exited();
    let status = status?;
    info!("Main process exited with {}", status);
    Ok(exit_code(status))
}

/// Count the main application, then start accepting auxiliary requests.
/// An auxiliary process that exits before the main application starts can
/// then never drain the count.
fn start_service(
    plan: &TargetPlan,
    counter: &CounterHandle,
    socket: &Path,
) -> Option<JoinHandle<()>> {
    counter.spawned();
    match service::bind(socket) {
        Ok(listener) => {
            let state = ServiceState::new(plan.clone(), counter.clone());
            Some(tokio::spawn(async move {
                if let Err(e) = service::serve(listener, state).await {
                    error!("Helper service stopped: {}", e);
                }
            }))
        }
        Err(e) => {
            warn!("Could not listen on helper socket {}: {}", socket.display(), e);
            None
        }
    }
}

/// Where the helper talks to, and whether it owns the process's signals.
#[derive(Debug, Clone)]
pub struct HelperOptions {
    pub control_socket: PathBuf,
    pub helper_socket: PathBuf,
    pub handle_signals: bool,
}

impl Default for HelperOptions {
    fn default() -> Self {
        Self {
            control_socket: PathBuf::from(SANDBOX_CONTROL_SOCKET),
            helper_socket: PathBuf::from(SANDBOX_HELPER_SOCKET),
            handle_signals: true,
        }
    }
}

/// Helper entry point with the standard in-sandbox socket paths.
pub async fn run(env: HostEnv) -> Result<i32, SupervisorError> {
    run_with(env, &HelperOptions::default()).await
}

pub async fn run_with(env: HostEnv, options: &HelperOptions) -> Result<i32, SupervisorError> {
    info!("Starting helper");
    let plan = TargetPlan::from_env(&env)?;
    let notifier = Notifier::new(env.get("NOTIFY_SOCKET").map(String::from));
    if !notifier.is_enabled() {
        debug!("Notification of daemon status not supported");
    }
    if let Some(message) = env.get("netsockFail").filter(|m| !m.is_empty()) {
        tokio::spawn(notify_netsock_failure(message.to_string()));
    }

    let (counter, events) = counter::channel();
    let publisher = notifier.clone();
    let tracker = tokio::spawn(async move {
        run_counter(events, |published| match published {
            Publish::Status(n) => match publisher.send(&Notification::Status(n)) {
                Ok(_) => debug!("Updated tracking status: {}", n),
                Err(e) => warn!("Failed to update status: {}", e),
            },
            Publish::Drained => info!("All tracked processes have exited"),
        })
        .await
    });

    let signals = if options.handle_signals {
        Some(UnitSignals::install()?)
    } else {
        None
    };
    let helper_socket = options.helper_socket.as_path();
    let server = start_service(&plan, &counter, helper_socket);
    let outcome = run_main(&plan.main, &counter, &notifier, signals).await;
    if let Err(e) = &outcome {
        error!("{}", e);
    }
    drop(counter);

    let phase = tracker.await.map_err(io::Error::other)?;
    if phase == Phase::Draining {
        if let Err(e) = notifier.send(&Notification::Stopping) {
            warn!("Failed to notify stopping: {}", e);
        }
        control::send(&options.control_socket, ControlMessage::TerminateNow).await?;
        info!("Sent termination signal");
        debug!("Supervisor phase: {:?}", phase.finish());
    }
    if let Some(server) = server {
        server.abort();
    }
    let _ = std::fs::remove_file(helper_socket);
    outcome
}
