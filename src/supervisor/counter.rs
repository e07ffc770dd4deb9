//! Active-process accounting.
//!
//! Spawn and exit events from every task land on one unbounded queue; a
//! single loop folds them into a [`Phase`] and publishes each change.

use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountEvent {
    Spawned,
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Running(usize),
    /// Count reached zero and the termination signal has been requested.
    Draining,
    Terminated,
}

/// What the loop tells the outside world after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Publish {
    Status(usize),
    Drained,
}

impl Phase {
    /// Fold one event. Returns the next phase and what to publish.
    pub fn apply(self, event: CountEvent) -> (Phase, Vec<Publish>) {
        match (self, event) {
            (Phase::Idle, CountEvent::Spawned) => (Phase::Running(1), vec![Publish::Status(1)]),
            (Phase::Running(n), CountEvent::Spawned) => {
                (Phase::Running(n + 1), vec![Publish::Status(n + 1)])
            }
            (Phase::Running(1), CountEvent::Exited) => (
                Phase::Draining,
                vec![Publish::Status(0), Publish::Drained],
            ),
            (Phase::Running(n), CountEvent::Exited) => {
                (Phase::Running(n - 1), vec![Publish::Status(n - 1)])
            }
            (Phase::Idle, CountEvent::Exited) => {
                warn!("Exit event before any process was tracked");
                (Phase::Idle, Vec::new())
            }
            (phase @ (Phase::Draining | Phase::Terminated), event) => {
                debug!("Ignoring {:?} after the count reached zero", event);
                (phase, Vec::new())
            }
        }
    }

    /// The termination signal went out.
    pub fn finish(self) -> Phase {
        match self {
            Phase::Draining => Phase::Terminated,
            other => other,
        }
    }
}

/// Sender side, cloned into every task that starts or reaps a process.
#[derive(Debug, Clone)]
pub struct CounterHandle {
    tx: mpsc::UnboundedSender<CountEvent>,
}

impl CounterHandle {
    pub fn spawned(&self) {
        self.send(CountEvent::Spawned);
    }

    pub fn exited(&self) {
        self.send(CountEvent::Exited);
    }

    fn send(&self, event: CountEvent) {
        if self.tx.send(event).is_err() {
            debug!("Counter loop gone, dropped {:?}", event);
        }
    }
}

pub fn channel() -> (CounterHandle, mpsc::UnboundedReceiver<CountEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CounterHandle { tx }, rx)
}

/// Consume events until the count drains to zero.
///
/// Returns the final phase: `Draining` once zero was reached, or the phase
/// at which every sender went away.
pub async fn run_counter<F>(mut events: mpsc::UnboundedReceiver<CountEvent>, mut publish: F) -> Phase
where
    F: FnMut(Publish),
{
    let mut phase = Phase::Idle;
    debug!("Start counter init done");
    while let Some(event) = events.recv().await {
        let (next, out) = phase.apply(event);
        phase = next;
        for p in out {
            publish(p);
        }
        if phase == Phase::Draining {
            break;
        }
    }
    phase
}
