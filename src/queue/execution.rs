//! Sequential execution of the queue against a [`DeviceLayer`].
//!
//! One worker task walks the tree depth-first over enabled entries. It holds
//! the queue lock only while reading the next step or recording a result;
//! device calls run with the lock released, racing against the device event
//! stream so progress is applied while a task is in flight.
//!
//! Pause and stop requests are honoured at task boundaries. A stop that
//! arrives while a task executes interrupts the device and marks only that
//! task as stopped.
//!
//! [`DeviceLayer`]: crate::device::DeviceLayer

use crate::device::{DeviceEvent, DeviceOutcome};
use crate::error::{QueueError, QueueResult};
use crate::queue::events::QueueEvent;
use crate::queue::manager::{Inner, QueueState};
use crate::queue::projection::{Projector, QueueStatus};
use crate::queue::types::*;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Lifecycle of the execution engine
#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExecState {
    #[default]
    Idle,
    Running,
    Paused,
    Stopping,
    Stopped,
    Failed,
}

impl ExecState {
    /// Whether a run is in progress
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ExecState::Running | ExecState::Paused | ExecState::Stopping
        )
    }
}

impl fmt::Display for ExecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecState::Idle => "idle",
            ExecState::Running => "running",
            ExecState::Paused => "paused",
            ExecState::Stopping => "stopping",
            ExecState::Stopped => "stopped",
            ExecState::Failed => "failed",
        };
        f.write_str(name)
    }
}

impl From<ExecState> for QueueStatus {
    fn from(state: ExecState) -> Self {
        match state {
            ExecState::Running => QueueStatus::QueueRunning,
            ExecState::Paused => QueueStatus::QueuePaused,
            ExecState::Failed => QueueStatus::QueueFailed,
            ExecState::Idle | ExecState::Stopping | ExecState::Stopped => {
                QueueStatus::QueueStopped
            }
        }
    }
}

/// Engine bookkeeping kept next to the tree
#[derive(Debug, Clone, Default)]
pub struct ExecutionStatus {
    pub state: ExecState,
    /// Current entry: the leaf in flight, or an interleaved group while its wedges run
    pub current: Option<NodeId>,
    /// Leaf whose `execute` call is in flight
    pub executing: Option<NodeId>,
    pub mounted_sample: Option<NodeId>,
    pub run_id: Option<String>,
    pub last_summary: Option<RunSummary>,
}

/// What a run covers
#[derive(Debug, Clone, PartialEq)]
pub enum RunScope {
    /// Every enabled sample in queue order
    Queue,
    Sample(NodeId),
    /// A task group, interleaved group or leaf task, with its sample mounted first
    Subtree(NodeId),
}

/// Outcome of a finished run
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct RunSummary {
    pub run_id: String,
    pub target: Option<NodeId>,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    /// `Idle` after a complete run, otherwise `Stopped` or `Failed`
    pub final_state: ExecState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

enum Flow {
    Continue,
    Stop,
}

enum Unit {
    Leaf(NodeId),
    Interleaved(NodeId),
}

enum LeafResult {
    Succeeded,
    Skipped,
    Stopped,
}

/// The worker driving one run
pub(crate) struct Worker {
    inner: Arc<Inner>,
    scope: RunScope,
    /// Nodes a subtree run may touch
    scope_nodes: Option<HashSet<NodeId>>,
    run_id: String,
    target: Option<NodeId>,
    started_at: DateTime<Utc>,
    succeeded: usize,
    skipped: usize,
    failed: usize,
    visited: HashSet<NodeId>,
    device_rx: mpsc::UnboundedReceiver<DeviceEvent>,
}

impl Worker {
    pub(crate) fn new(
        inner: Arc<Inner>,
        state: &QueueState,
        scope: RunScope,
        run_id: String,
        target: Option<NodeId>,
    ) -> QueueResult<Self> {
        let scope_nodes = match &scope {
            RunScope::Subtree(node) => {
                let mut nodes: HashSet<NodeId> =
                    state.tree.descendants(*node)?.into_iter().collect();
                let mut current = Some(*node);
                while let Some(id) = current {
                    nodes.insert(id);
                    current = state.tree.parent(id)?;
                }
                Some(nodes)
            }
            _ => None,
        };

        let device_rx = inner.device_events.subscribe();

        Ok(Self {
            inner,
            scope,
            scope_nodes,
            run_id,
            target,
            started_at: Utc::now(),
            succeeded: 0,
            skipped: 0,
            failed: 0,
            visited: HashSet::new(),
            device_rx,
        })
    }

    pub(crate) async fn run(mut self) -> QueueResult<RunSummary> {
        info!("Run {} started with scope {:?}", self.run_id, self.scope);
        let result = self.walk().await;
        self.finish(result).await
    }

    fn in_scope(&self, id: NodeId) -> bool {
        self.scope_nodes
            .as_ref()
            .is_none_or(|nodes| nodes.contains(&id))
    }

    async fn walk(&mut self) -> QueueResult<Flow> {
        while let Some(sample) = self.next_sample().await {
            if let Flow::Stop = self.checkpoint().await {
                return Ok(Flow::Stop);
            }

            self.mount(sample).await?;

            while let Some(unit) = self.next_unit(sample).await {
                if let Flow::Stop = self.checkpoint().await {
                    return Ok(Flow::Stop);
                }

                let flow = match unit {
                    Unit::Leaf(leaf) => match self.run_leaf(leaf, leaf).await? {
                        LeafResult::Stopped => Flow::Stop,
                        _ => Flow::Continue,
                    },
                    Unit::Interleaved(group) => self.run_interleaved(group).await?,
                };

                if let Flow::Stop = flow {
                    return Ok(Flow::Stop);
                }
            }
        }

        Ok(Flow::Continue)
    }

    /// Pick the next sample to visit, skipping disabled ones
    async fn next_sample(&mut self) -> Option<NodeId> {
        let state = self.inner.state.lock().await;
        let tree = &state.tree;

        let candidates: Vec<NodeId> = match &self.scope {
            RunScope::Queue => tree.samples().to_vec(),
            RunScope::Sample(sample) => vec![*sample],
            RunScope::Subtree(node) => tree.sample_of(*node).into_iter().collect(),
        };

        for sample in candidates {
            if !self.visited.insert(sample) {
                continue;
            }
            match tree.entry(sample) {
                Ok(entry) if entry.enabled => return Some(sample),
                Ok(_) => debug!("Skipping disabled sample node {}", sample),
                Err(_) => debug!("Sample node {} vanished before it ran", sample),
            }
        }

        None
    }

    /// Next enabled unit of work under a sample, read from the live tree
    async fn next_unit(&mut self, sample: NodeId) -> Option<Unit> {
        let state = self.inner.state.lock().await;
        let tree = &state.tree;
        let groups = tree.children(sample).ok()?.to_vec();

        for group_id in groups {
            let Ok(group) = tree.get(group_id) else {
                continue;
            };
            if !group.entry.enabled || !self.in_scope(group_id) {
                continue;
            }

            if group.kind.is_interleaved() {
                if self.visited.insert(group_id) {
                    return Some(Unit::Interleaved(group_id));
                }
                continue;
            }

            for task_id in &group.children {
                let enabled = tree.entry(*task_id).is_ok_and(|entry| entry.enabled);
                if enabled && self.in_scope(*task_id) && self.visited.insert(*task_id) {
                    return Some(Unit::Leaf(*task_id));
                }
            }
        }

        None
    }

    /// Block while paused; report whether the run should end here
    async fn checkpoint(&self) -> Flow {
        loop {
            let resumed = self.inner.resume.notified();
            tokio::pin!(resumed);
            resumed.as_mut().enable();

            {
                let state = self.inner.state.lock().await;
                match state.status.state {
                    ExecState::Running => return Flow::Continue,
                    ExecState::Paused => {
                        debug!("Run {} paused at a task boundary", self.run_id);
                    }
                    _ => return Flow::Stop,
                }
            }

            resumed.await;
        }
    }

    async fn mount(&mut self, sample: NodeId) -> QueueResult<()> {
        let view = {
            let state = self.inner.state.lock().await;
            let already_mounted = state.status.mounted_sample == Some(sample);
            if already_mounted && matches!(self.scope, RunScope::Subtree(_)) {
                debug!("Sample node {} already mounted", sample);
                return Ok(());
            }
            state.projector().sample_view(sample)?
        };

        match self.inner.device.mount(&view).await {
            Ok(()) => {
                let mut state = self.inner.state.lock().await;
                state.status.mounted_sample = Some(sample);
                self.inner.emit(QueueEvent::SampleMounted {
                    sample_id: view.sample_id,
                });
                Ok(())
            }
            Err(e) => {
                error!("Mounting sample {} failed: {}", view.sample_id, e);
                let mut state = self.inner.state.lock().await;
                state.status.state = ExecState::Failed;
                state.status.mounted_sample = None;
                self.failed += 1;
                self.inner.emit(QueueEvent::ExecutionFailed {
                    node_id: sample,
                    reason: e.to_string(),
                });
                Err(QueueError::Device(e))
            }
        }
    }

    /// Execute one leaf; `current` is the entry reported as running
    async fn run_leaf(&mut self, leaf: NodeId, current: NodeId) -> QueueResult<LeafResult> {
        let view = {
            let mut state = self.inner.state.lock().await;
            state.status.current = Some(current);
            state.status.executing = Some(leaf);
            state.tree.set_status(leaf, EntryStatus::Running)?;
            state.tree.progress_mut(leaf)?.images_taken = 0;
            state.projector().task_view(leaf)?
        };
        self.inner.emit(QueueEvent::EntryStarted { node_id: leaf });

        let outcome = {
            let device = Arc::clone(&self.inner.device);
            let execution = device.execute(&view);
            tokio::pin!(execution);

            loop {
                tokio::select! {
                    outcome = &mut execution => break outcome,
                    Some(event) = self.device_rx.recv() => self.apply_device_event(event).await,
                }
            }
        };

        while let Ok(event) = self.device_rx.try_recv() {
            self.apply_device_event(event).await;
        }

        let mut state = self.inner.state.lock().await;
        state.status.executing = None;
        if current == leaf {
            state.status.current = None;
        }

        if matches!(
            state.status.state,
            ExecState::Stopping | ExecState::Stopped
        ) {
            info!("Node {} stopped while executing", leaf);
            state.tree.set_executed(leaf, true)?;
            state.tree.set_enabled_raw(leaf, false)?;
            state.tree.set_status(leaf, EntryStatus::Failed)?;
            state.status.current = None;
            state.status.state = ExecState::Stopped;
            self.inner.emit(QueueEvent::ExecutionStopped {
                interrupted: Some(leaf),
            });
            return Ok(LeafResult::Stopped);
        }

        match outcome {
            DeviceOutcome::Success => {
                state.tree.set_status(leaf, EntryStatus::Success)?;
                state.tree.set_executed(leaf, true)?;
                self.succeeded += 1;
                self.inner.emit(QueueEvent::EntryFinished {
                    node_id: leaf,
                    status: EntryStatus::Success,
                });
                Ok(LeafResult::Succeeded)
            }
            DeviceOutcome::Skip(reason) => {
                warn!("Skipping node {}: {}", leaf, reason);
                state.tree.set_status(leaf, EntryStatus::Failed)?;
                state.tree.set_executed(leaf, false)?;
                self.skipped += 1;
                self.inner.emit(QueueEvent::EntrySkipped {
                    node_id: leaf,
                    reason,
                });
                Ok(LeafResult::Skipped)
            }
            DeviceOutcome::Failure(reason) => {
                error!("Node {} failed, aborting the run: {}", leaf, reason);
                state.tree.set_status(leaf, EntryStatus::Failed)?;
                state.status.current = None;
                state.status.state = ExecState::Failed;
                self.failed += 1;
                self.inner.emit(QueueEvent::ExecutionFailed {
                    node_id: leaf,
                    reason: reason.clone(),
                });
                Err(QueueError::HardFailure {
                    node_id: leaf,
                    reason,
                })
            }
        }
    }

    async fn run_interleaved(&mut self, group: NodeId) -> QueueResult<Flow> {
        let wedges: Vec<NodeId> = {
            let mut state = self.inner.state.lock().await;
            state.status.current = Some(group);
            state.tree.set_status(group, EntryStatus::Running)?;
            state.tree.progress_mut(group)?.current_wedge = None;
            let children = state.tree.children(group)?.to_vec();
            children
                .into_iter()
                .filter(|id| state.tree.entry(*id).is_ok_and(|entry| entry.enabled))
                .collect()
        };
        self.inner.emit(QueueEvent::EntryStarted { node_id: group });

        let mut all_succeeded = true;
        for (index, wedge) in wedges.into_iter().enumerate() {
            if let Flow::Stop = self.checkpoint().await {
                self.release_group(group).await?;
                return Ok(Flow::Stop);
            }

            {
                let mut state = self.inner.state.lock().await;
                let progress = state.tree.progress_mut(group)?;
                progress.current_wedge = Some(progress.current_wedge.map_or(index, |i| i.max(index)));
            }

            let result = match self.run_leaf(wedge, group).await {
                Ok(result) => result,
                Err(e) => {
                    let mut state = self.inner.state.lock().await;
                    state.tree.set_status(group, EntryStatus::Failed)?;
                    return Err(e);
                }
            };

            match result {
                LeafResult::Succeeded => {}
                LeafResult::Skipped => all_succeeded = false,
                LeafResult::Stopped => {
                    self.release_group(group).await?;
                    return Ok(Flow::Stop);
                }
            }

            self.inner.emit(QueueEvent::InterleavedWedgeDone {
                group_id: group,
                wedge_index: index,
            });
        }

        let status = if all_succeeded {
            EntryStatus::Success
        } else {
            EntryStatus::Failed
        };

        let mut state = self.inner.state.lock().await;
        state.tree.set_status(group, status)?;
        state.tree.set_executed(group, all_succeeded)?;
        state.status.current = None;
        self.inner.emit(QueueEvent::EntryFinished {
            node_id: group,
            status,
        });

        Ok(Flow::Continue)
    }

    /// Return an interleaved group to the queue after a stop
    async fn release_group(&self, group: NodeId) -> QueueResult<()> {
        let mut state = self.inner.state.lock().await;
        if state.tree.entry(group)?.status == EntryStatus::Running {
            state.tree.set_status(group, EntryStatus::Queued)?;
        }
        state.status.current = None;
        Ok(())
    }

    /// Apply a device notification to the tree under a short lock
    async fn apply_device_event(&self, event: DeviceEvent) {
        let mut state = self.inner.state.lock().await;

        match event {
            DeviceEvent::ImageTaken {
                node_id,
                image_number,
            } => {
                let Ok(progress) = state.tree.progress_mut(node_id) else {
                    debug!("Image event for unknown node {}", node_id);
                    return;
                };
                progress.images_taken = progress.images_taken.max(image_number);

                let fraction = state.projector().progress(node_id).unwrap_or(0.0);
                self.inner.emit(QueueEvent::Progress { node_id, fraction });
            }
            DeviceEvent::OscillationStarted { node_id } => {
                debug!("Oscillation started for node {}", node_id);
            }
            DeviceEvent::OscillationFinished { node_id } => {
                debug!("Oscillation finished for node {}", node_id);
            }
            DeviceEvent::CollectionEnded { node_id } => {
                debug!("Collection ended for node {}", node_id);
            }
            DeviceEvent::DiffractionPlanAvailable {
                characterisation_id,
                collections,
            } => match state.store_diffraction_plan(characterisation_id, &collections) {
                Ok(promoted) => {
                    self.inner.emit(QueueEvent::DiffractionPlanAvailable {
                        characterisation_id,
                        collections: collections.len(),
                        promoted,
                    });
                }
                Err(e) => {
                    warn!(
                        "Ignoring diffraction plan for node {}: {}",
                        characterisation_id, e
                    );
                }
            },
        }
    }

    async fn finish(self, result: QueueResult<Flow>) -> QueueResult<RunSummary> {
        let mut state = self.inner.state.lock().await;

        let final_state = match &result {
            Ok(Flow::Continue) => {
                if state.status.state.is_active() {
                    state.status.state = ExecState::Idle;
                }
                state.status.state
            }
            Ok(Flow::Stop) => {
                state.status.state = ExecState::Stopped;
                ExecState::Stopped
            }
            Err(_) => {
                state.status.state = ExecState::Failed;
                ExecState::Failed
            }
        };
        state.status.current = None;
        state.status.executing = None;
        state.status.run_id = None;

        let summary = RunSummary {
            run_id: self.run_id.clone(),
            target: self.target,
            succeeded: self.succeeded,
            skipped: self.skipped,
            failed: self.failed,
            final_state,
            started_at: self.started_at,
            finished_at: Utc::now(),
        };
        state.status.last_summary = Some(summary.clone());
        drop(state);

        info!(
            "Run {} ended {}: {} succeeded, {} skipped, {} failed",
            summary.run_id, final_state, summary.succeeded, summary.skipped, summary.failed
        );

        match result {
            Ok(Flow::Continue) => {
                self.inner.emit(QueueEvent::ExecutionFinished {
                    summary: summary.clone(),
                });
                Ok(summary)
            }
            Ok(Flow::Stop) => Ok(summary),
            Err(e) => Err(e),
        }
    }
}

impl QueueState {
    /// Projector reporting the engine's current entry as running
    pub fn projector(&self) -> Projector<'_> {
        Projector::new(&self.tree, &self.context, self.status.current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_state_maps_to_client_status() {
        assert_eq!(QueueStatus::from(ExecState::Running), QueueStatus::QueueRunning);
        assert_eq!(QueueStatus::from(ExecState::Paused), QueueStatus::QueuePaused);
        assert_eq!(QueueStatus::from(ExecState::Idle), QueueStatus::QueueStopped);
        assert_eq!(QueueStatus::from(ExecState::Failed), QueueStatus::QueueFailed);
    }

    #[test]
    fn test_exec_state_activity() {
        assert!(ExecState::Paused.is_active());
        assert!(ExecState::Stopping.is_active());
        assert!(!ExecState::Stopped.is_active());
        assert_eq!(ExecState::Stopping.to_string(), "stopping");
    }
}
