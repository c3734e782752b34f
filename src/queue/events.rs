use crate::queue::execution::RunSummary;
use crate::queue::types::{EntryStatus, NodeId};
use anyhow::Result;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// In-process publish/subscribe bus.
///
/// Each subscriber owns an unbounded channel, so every event reaches every
/// live subscriber in emission order. Subscribers whose receiver was
/// dropped are pruned on the next publish.
pub struct EventBus<E> {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<E>>>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            subscribers: Arc::clone(&self.subscribers),
        }
    }
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    /// Deliver an event to all live subscribers, returning how many received it
    pub fn publish(&self, event: E) -> usize {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<E>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Events emitted by the queue for clients
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    SampleAdded {
        node_id: NodeId,
        sample_id: String,
    },
    TaskAdded {
        node_id: NodeId,
        sample_node: NodeId,
    },
    NodeRemoved {
        node_id: NodeId,
    },
    QueueReordered {
        parent: NodeId,
    },
    EnabledChanged {
        node_id: NodeId,
        enabled: bool,
    },
    QueueCleared,
    SampleMounted {
        sample_id: String,
    },
    ExecutionStarted {
        run_id: String,
        target: Option<NodeId>,
    },
    EntryStarted {
        node_id: NodeId,
    },
    EntryFinished {
        node_id: NodeId,
        status: EntryStatus,
    },
    EntrySkipped {
        node_id: NodeId,
        reason: String,
    },
    Progress {
        node_id: NodeId,
        fraction: f64,
    },
    InterleavedWedgeDone {
        group_id: NodeId,
        wedge_index: usize,
    },
    ExecutionPaused,
    ExecutionResumed,
    ExecutionStopped {
        interrupted: Option<NodeId>,
    },
    ExecutionFinished {
        summary: RunSummary,
    },
    ExecutionFailed {
        node_id: NodeId,
        reason: String,
    },
    DiffractionPlanAvailable {
        characterisation_id: NodeId,
        collections: usize,
        promoted: Vec<NodeId>,
    },
}

/// Handler for queue events, called synchronously as they are emitted
pub trait QueueEventHandler {
    fn handle_event(&self, event: &QueueEvent) -> Result<()>;
}

/// Default event handler that logs every event
pub struct LoggingEventHandler;

impl QueueEventHandler for LoggingEventHandler {
    fn handle_event(&self, event: &QueueEvent) -> Result<()> {
        match event {
            QueueEvent::ExecutionStarted { run_id, target } => {
                info!("Queue execution {} started (target {:?})", run_id, target);
            }
            QueueEvent::EntryStarted { node_id } => {
                info!("Executing node {}", node_id);
            }
            QueueEvent::EntryFinished { node_id, status } => {
                info!("Node {} finished with status {:?}", node_id, status);
            }
            QueueEvent::EntrySkipped { node_id, reason } => {
                warn!("Node {} skipped: {}", node_id, reason);
            }
            QueueEvent::ExecutionFailed { node_id, reason } => {
                warn!("Queue execution failed at node {}: {}", node_id, reason);
            }
            QueueEvent::ExecutionStopped { interrupted } => {
                info!("Queue execution stopped (interrupted {:?})", interrupted);
            }
            QueueEvent::ExecutionFinished { summary } => {
                info!(
                    "Queue execution {} finished: {} succeeded, {} skipped, {} failed",
                    summary.run_id, summary.succeeded, summary.skipped, summary.failed
                );
            }
            QueueEvent::DiffractionPlanAvailable {
                characterisation_id,
                collections,
                ..
            } => {
                info!(
                    "Diffraction plan with {} collections available for node {}",
                    collections, characterisation_id
                );
            }
            QueueEvent::Progress { .. } => {}
            other => {
                info!("Queue event: {:?}", other);
            }
        }
        Ok(())
    }
}
