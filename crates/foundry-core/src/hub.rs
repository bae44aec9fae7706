//! Broadcast hub.
//!
//! The hub owns the [`MachineRegistry`] inside a single task and processes
//! commands one at a time in arrival order. This gives one global total
//! order over connects, bootstrap requests and patches without any locks.
//!
//! ```text
//!   HubHandle ──cmd──▶ ┌─────────────────────┐ ──Arc<Frame>──▶ observer queue
//!   HubHandle ──cmd──▶ │ Hub (registry owner) │ ──Arc<Frame>──▶ observer queue
//!                      └─────────────────────┘ ──Arc<Frame>──▶ observer queue
//! ```
//!
//! Every observer has its own bounded queue. Fan-out only clones an `Arc`
//! into each queue, so a slow reader never delays the others. An observer
//! whose queue is full is dropped: its receiver sees the queue close and
//! the observer has to reconnect, which bootstraps it with a fresh
//! snapshot. Bootstrap snapshots travel through the same queue as updates,
//! which keeps them ordered with respect to each other.

use crate::registry::MachineRegistry;
use foundry_protocol::{Frame, Machine, MachinePatch};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

/// Frames an observer may have queued before it is dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// An observer identifier.
pub type ObserverId = String;

/// Receiving end of an observer queue.
pub type ObserverReceiver = mpsc::Receiver<Arc<Frame>>;

type ObserverSender = mpsc::Sender<Arc<Frame>>;

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// The hub task has stopped.
    #[error("Hub is closed")]
    Closed,

    /// An observer with this id is already connected.
    #[error("Observer already connected: {0}")]
    AlreadyConnected(String),
}

/// Result of an applied patch.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    /// The updated record as broadcast.
    pub machine: Machine,
    /// Number of observers the update was queued to.
    pub recipients: usize,
}

/// Hub statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Number of connected observers.
    pub observers: usize,
    /// Number of machines in the registry.
    pub machines: usize,
    /// Patches applied since start.
    pub patches_applied: u64,
    /// Patches ignored for targeting unknown machines.
    pub patches_ignored: u64,
}

enum Command {
    Connect {
        observer: ObserverId,
        sender: ObserverSender,
        reply: oneshot::Sender<Result<(), HubError>>,
    },
    RequestSnapshot {
        observer: ObserverId,
    },
    Apply {
        patch: MachinePatch,
        reply: oneshot::Sender<Option<Applied>>,
    },
    Disconnect {
        observer: ObserverId,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<Machine>>,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Connect { observer, .. } => write!(f, "Connect({observer})"),
            Command::RequestSnapshot { observer } => write!(f, "RequestSnapshot({observer})"),
            Command::Apply { patch, .. } => write!(f, "Apply({})", patch.machine_id),
            Command::Disconnect { observer } => write!(f, "Disconnect({observer})"),
            Command::Snapshot { .. } => f.write_str("Snapshot"),
            Command::Stats { .. } => f.write_str("Stats"),
        }
    }
}

/// The registry owner task.
pub struct Hub {
    registry: MachineRegistry,
    observers: HashMap<ObserverId, ObserverSender>,
    commands: mpsc::UnboundedReceiver<Command>,
    patches_applied: u64,
    patches_ignored: u64,
}

impl Hub {
    /// Spawn the hub task on the current runtime.
    ///
    /// The task runs until every [`HubHandle`] has been dropped.
    #[must_use]
    pub fn spawn(registry: MachineRegistry) -> HubHandle {
        Self::spawn_with_capacity(registry, DEFAULT_QUEUE_CAPACITY)
    }

    /// Spawn the hub with a custom per-observer queue capacity.
    ///
    /// A capacity of zero is raised to one.
    #[must_use]
    pub fn spawn_with_capacity(registry: MachineRegistry, queue_capacity: usize) -> HubHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue_capacity = queue_capacity.max(1);
        info!(machines = registry.len(), queue_capacity, "Starting hub");

        let hub = Hub {
            registry,
            observers: HashMap::new(),
            commands: rx,
            patches_applied: 0,
            patches_ignored: 0,
        };
        tokio::spawn(hub.run());

        HubHandle {
            commands: tx,
            queue_capacity,
        }
    }

    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            self.handle(command);
        }
        info!("Hub stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Connect {
                observer,
                sender,
                reply,
            } => {
                let result = self.connect(observer, sender);
                let _ = reply.send(result);
            }

            Command::RequestSnapshot { observer } => {
                let Some(sender) = self.observers.get(&observer) else {
                    debug!(observer = %observer, "Snapshot requested by unknown observer");
                    return;
                };
                let frame = self.snapshot_frame();
                if !deliver(&observer, sender, frame) {
                    self.observers.remove(&observer);
                }
            }

            Command::Apply { patch, reply } => {
                let _ = reply.send(self.apply(patch));
            }

            Command::Disconnect { observer } => {
                if self.observers.remove(&observer).is_some() {
                    debug!(observer = %observer, observers = self.observers.len(), "Observer disconnected");
                }
            }

            Command::Snapshot { reply } => {
                let _ = reply.send(self.registry.snapshot());
            }

            Command::Stats { reply } => {
                let _ = reply.send(HubStats {
                    observers: self.observers.len(),
                    machines: self.registry.len(),
                    patches_applied: self.patches_applied,
                    patches_ignored: self.patches_ignored,
                });
            }
        }
    }

    fn connect(&mut self, observer: ObserverId, sender: ObserverSender) -> Result<(), HubError> {
        if self.observers.contains_key(&observer) {
            warn!(observer = %observer, "Duplicate observer id");
            return Err(HubError::AlreadyConnected(observer));
        }

        // Bootstrap in the same step as registration so no update slips in between.
        if !deliver(&observer, &sender, self.snapshot_frame()) {
            return Ok(());
        }

        self.observers.insert(observer.clone(), sender);
        debug!(observer = %observer, observers = self.observers.len(), "Observer connected");
        Ok(())
    }

    fn apply(&mut self, patch: MachinePatch) -> Option<Applied> {
        let Some(machine) = self.registry.apply_patch(patch).cloned() else {
            self.patches_ignored += 1;
            return None;
        };
        self.patches_applied += 1;

        let recipients = self.broadcast(Arc::new(Frame::machine_update(machine.clone())));
        trace!(machine = %machine.id, recipients, "Broadcast machine update");

        Some(Applied {
            machine,
            recipients,
        })
    }

    fn broadcast(&mut self, frame: Arc<Frame>) -> usize {
        let mut recipients = 0;
        self.observers.retain(|observer, sender| {
            let kept = deliver(observer, sender, Arc::clone(&frame));
            recipients += usize::from(kept);
            kept
        });
        recipients
    }

    fn snapshot_frame(&self) -> Arc<Frame> {
        Arc::new(Frame::machines_list(self.registry.snapshot()))
    }
}

/// Queue a frame without waiting. Returns `false` if the observer must be
/// dropped, either because its receiver is gone or because it fell a full
/// queue behind.
fn deliver(observer: &str, sender: &ObserverSender, frame: Arc<Frame>) -> bool {
    match sender.try_send(frame) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!(observer = %observer, "Observer queue full, dropping observer");
            false
        }
        Err(TrySendError::Closed(_)) => {
            debug!(observer = %observer, "Pruning closed observer queue");
            false
        }
    }
}

/// Cloneable handle to the hub task.
#[derive(Debug, Clone)]
pub struct HubHandle {
    commands: mpsc::UnboundedSender<Command>,
    queue_capacity: usize,
}

impl HubHandle {
    fn send(&self, command: Command) -> Result<(), HubError> {
        self.commands.send(command).map_err(|_| HubError::Closed)
    }

    /// Register an observer.
    ///
    /// The returned queue starts with a `machines:list` snapshot, followed
    /// by every `machine:update` applied after it. If the queue fills up the
    /// hub drops the observer and the receiver yields `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is taken or the hub is closed.
    pub async fn connect(&self, observer: impl Into<ObserverId>) -> Result<ObserverReceiver, HubError> {
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let (reply, rx) = oneshot::channel();
        self.send(Command::Connect {
            observer: observer.into(),
            sender,
            reply,
        })?;
        rx.await.map_err(|_| HubError::Closed)??;
        Ok(receiver)
    }

    /// Queue a fresh snapshot to a connected observer.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub is closed.
    pub fn request_snapshot(&self, observer: impl Into<ObserverId>) -> Result<(), HubError> {
        self.send(Command::RequestSnapshot {
            observer: observer.into(),
        })
    }

    /// Apply a patch and fan the result out to every observer.
    ///
    /// Returns `None` if the patch targets an unknown machine.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub is closed.
    pub async fn apply(&self, patch: MachinePatch) -> Result<Option<Applied>, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Apply { patch, reply })?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Remove an observer from future fan-out.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub is closed.
    pub fn disconnect(&self, observer: impl Into<ObserverId>) -> Result<(), HubError> {
        self.send(Command::Disconnect {
            observer: observer.into(),
        })
    }

    /// Current registry snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub is closed.
    pub async fn snapshot(&self) -> Result<Vec<Machine>, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply })?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Hub statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub is closed.
    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats { reply })?;
        rx.await.map_err(|_| HubError::Closed)
    }
}
