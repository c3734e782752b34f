use crate::device::{
    DeviceEvent, DeviceLayer, SimulatedDevice, SimulatedDeviceConfig,
};
use crate::error::{QueueError, QueueResult};
use crate::queue::context::{QueueConfig, QueueContext, sanitize_group_folder};
use crate::queue::events::{EventBus, QueueEvent, QueueEventHandler};
use crate::queue::execution::{ExecState, ExecutionStatus, RunScope, RunSummary, Worker};
use crate::queue::items::{
    InterleavedRequest, ItemBuilder, SampleItem, TaskItem, update_collection,
};
use crate::queue::path::RunNumberCache;
use crate::queue::persistence::QueueStore;
use crate::queue::projection::{QueueSnapshot, QueueStateRecord, SampleView, TaskView};
use crate::queue::tree::QueueTree;
use crate::queue::types::*;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Everything guarded by the queue lock
#[derive(Debug)]
pub struct QueueState {
    pub tree: QueueTree,
    pub context: QueueContext,
    pub status: ExecutionStatus,
}

impl QueueState {
    pub fn new(context: QueueContext) -> Self {
        Self {
            tree: QueueTree::new(),
            context,
            status: ExecutionStatus::default(),
        }
    }

    /// Store collections proposed for a characterisation, promoting them
    /// into the queue when the characterisation asks for it
    pub(crate) fn store_diffraction_plan(
        &mut self,
        characterisation_id: NodeId,
        collections: &[AcquisitionParameters],
    ) -> QueueResult<Vec<NodeId>> {
        let (reference, auto_add) = match &self.tree.get(characterisation_id)?.kind {
            NodeKind::Task(TaskPayload::Characterisation(ch)) => {
                (ch.reference.clone(), ch.auto_add_diff_plan)
            }
            other => {
                return Err(QueueError::InvalidOperation(format!(
                    "{} cannot hold a diffraction plan",
                    other.describe()
                )));
            }
        };

        let mut plan: Vec<DataCollectionData> = Vec::with_capacity(collections.len());
        for acquisition in collections {
            let mut path_template = reference.path_template.clone();
            path_template.reference_image_prefix.clear();
            path_template.start_num = acquisition.first_image;
            path_template.num_files = acquisition.num_images;
            path_template.run_number = self.context.run_numbers.next_run_number(
                &path_template,
                self.tree
                    .path_templates()
                    .into_iter()
                    .chain(plan.iter().map(|dc| &dc.path_template)),
            );

            plan.push(DataCollectionData {
                path_template,
                acquisition: acquisition.clone(),
                experiment_type: ExperimentType::Native,
                shape: reference.shape.clone(),
            });
        }

        if let NodeKind::Task(TaskPayload::Characterisation(ch)) =
            &mut self.tree.get_mut(characterisation_id)?.kind
        {
            ch.diffraction_plan = plan;
        }
        info!(
            "Stored diffraction plan with {} collections on node {}",
            collections.len(),
            characterisation_id
        );

        if auto_add {
            promote_diffraction_plan(&mut self.tree, characterisation_id)
        } else {
            Ok(Vec::new())
        }
    }

    fn sample_node(&self, sample_id: &str) -> QueueResult<NodeId> {
        self.tree
            .find_sample(sample_id)
            .ok_or_else(|| QueueError::SampleNotFound(sample_id.to_string()))
    }
}

/// Move a characterisation's pending plan into the queue, one enabled
/// collection per new task group
fn promote_diffraction_plan(
    tree: &mut QueueTree,
    characterisation_id: NodeId,
) -> QueueResult<Vec<NodeId>> {
    let plan = match &mut tree.get_mut(characterisation_id)?.kind {
        NodeKind::Task(TaskPayload::Characterisation(ch)) => std::mem::take(&mut ch.diffraction_plan),
        other => {
            return Err(QueueError::InvalidOperation(format!(
                "{} has no diffraction plan",
                other.describe()
            )));
        }
    };

    let sample = tree
        .sample_of(characterisation_id)
        .ok_or(QueueError::NotFound(characterisation_id))?;

    let mut promoted = Vec::with_capacity(plan.len());
    for dc in plan {
        let group = tree.add_child(sample, NodeKind::TaskGroup(TaskGroupData::default()))?;
        let id = tree.add_child(group, NodeKind::Task(TaskPayload::DataCollection(dc)))?;
        tree.get_mut(id)?.origin = Some(characterisation_id);
        tree.recompute_ancestors(id)?;
        promoted.push(id);
    }

    debug!(
        "Promoted {} diffraction plan collections of node {}",
        promoted.len(),
        characterisation_id
    );
    Ok(promoted)
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

type SharedHandler = Arc<dyn QueueEventHandler + Send + Sync>;

pub(crate) struct Inner {
    pub(crate) state: Mutex<QueueState>,
    pub(crate) device: Arc<dyn DeviceLayer>,
    pub(crate) device_events: EventBus<DeviceEvent>,
    pub(crate) resume: Notify,
    events: EventBus<QueueEvent>,
    handlers: StdMutex<Vec<SharedHandler>>,
    worker: StdMutex<Option<JoinHandle<QueueResult<RunSummary>>>>,
}

impl Inner {
    /// Hand an event to every handler, then to bus subscribers
    pub(crate) fn emit(&self, event: QueueEvent) {
        let handlers = lock(&self.handlers).clone();
        for handler in handlers {
            if let Err(e) = handler.handle_event(&event) {
                warn!("Queue event handler failed: {}", e);
            }
        }
        self.events.publish(event);
    }
}

/// Wire format of a persisted queue
#[derive(Deserialize)]
struct StoredQueue {
    #[serde(default)]
    sample_order: Vec<String>,
    #[serde(flatten)]
    samples: HashMap<String, SampleItem>,
}

/// Control plane of the queue: the one place clients mutate, project and
/// run the tree.
///
/// Cloning is cheap and every clone drives the same queue. Compound
/// mutations run against a draft of the tree and are committed only when
/// they succeed, so a failed call leaves the queue untouched.
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<Inner>,
}

impl QueueManager {
    pub fn new(
        config: &QueueConfig,
        device: Arc<dyn DeviceLayer>,
        device_events: EventBus<DeviceEvent>,
    ) -> Self {
        let inner = Inner {
            state: Mutex::new(QueueState::new(QueueContext::from_config(config))),
            device,
            device_events,
            resume: Notify::new(),
            events: EventBus::new(),
            handlers: StdMutex::new(Vec::new()),
            worker: StdMutex::new(None),
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Manager driving a [`SimulatedDevice`] timed by the configuration
    pub fn with_simulated_device(config: &QueueConfig) -> (Self, Arc<SimulatedDevice>) {
        let timing = SimulatedDeviceConfig {
            image_delay: Duration::from_millis(config.simulation.image_delay_ms),
            mount_delay: Duration::from_millis(config.simulation.mount_delay_ms),
            task_delay: Duration::from_millis(config.simulation.task_delay_ms),
        };
        Self::with_device(config, |bus| SimulatedDevice::with_config(bus, timing))
    }

    /// Manager over a device built on the manager's device event bus
    pub fn with_device<D, F>(config: &QueueConfig, build: F) -> (Self, Arc<D>)
    where
        D: DeviceLayer + 'static,
        F: FnOnce(EventBus<DeviceEvent>) -> D,
    {
        let bus = EventBus::new();
        let device = Arc::new(build(bus.clone()));
        let manager = Self::new(config, device.clone(), bus);
        (manager, device)
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    pub fn add_event_handler(&self, handler: SharedHandler) {
        lock(&self.inner.handlers).push(handler);
    }

    /// Run a read-only closure against the locked queue state
    pub async fn read<R>(&self, f: impl FnOnce(&QueueState) -> R) -> R {
        let state = self.inner.state.lock().await;
        f(&state)
    }

    /// Apply a mutation to a draft tree and commit it only on success
    async fn mutate<R>(
        &self,
        f: impl FnOnce(&mut QueueTree, &QueueContext, &ExecutionStatus) -> QueueResult<(R, Vec<QueueEvent>)>,
    ) -> QueueResult<R> {
        let mut state = self.inner.state.lock().await;
        let mut draft = state.tree.clone();

        let (result, events) = f(&mut draft, &state.context, &state.status)?;
        state.tree = draft;
        drop(state);

        for event in events {
            self.inner.emit(event);
        }
        Ok(result)
    }

    // Projection

    pub async fn snapshot(&self) -> QueueResult<QueueSnapshot> {
        self.inner.state.lock().await.projector().project()
    }

    pub async fn queue_state(&self) -> QueueStateRecord {
        let state = self.inner.state.lock().await;
        let current = state
            .status
            .mounted_sample
            .and_then(|id| state.tree.sample_data(id).ok())
            .map(|sample| sample.sample_id.clone());
        state
            .projector()
            .queue_state(state.status.state.into(), current)
    }

    pub async fn get_sample(&self, sample_id: &str) -> QueueResult<SampleView> {
        let state = self.inner.state.lock().await;
        let node = state.sample_node(sample_id)?;
        state.projector().sample_view(node)
    }

    pub async fn get_task(&self, sample_id: &str, queue_id: NodeId) -> QueueResult<TaskView> {
        let state = self.inner.state.lock().await;
        let sample = state.sample_node(sample_id)?;
        if state.tree.sample_of(queue_id) != Some(sample) {
            return Err(QueueError::NotFound(queue_id));
        }
        state.projector().task_view(queue_id)
    }

    pub async fn exec_state(&self) -> ExecState {
        self.inner.state.lock().await.status.state
    }

    // Adding items

    /// Add samples with their tasks, returning the new projection
    pub async fn add_items(&self, items: Vec<SampleItem>) -> QueueResult<QueueSnapshot> {
        self.mutate(|tree, context, _| {
            let mut events = Vec::new();
            for item in &items {
                let (_, added) = insert_sample_item(tree, context, item)?;
                events.extend(added);
            }
            Ok(((), events))
        })
        .await?;

        self.snapshot().await
    }

    pub async fn add_sample(&self, item: SampleItem) -> QueueResult<NodeId> {
        self.mutate(|tree, context, _| insert_sample_item(tree, context, &item))
            .await
    }

    /// Add tasks to samples already in the queue, located by
    /// `sampleQueueID` or else by `sampleID`
    pub async fn add_tasks(&self, items: Vec<TaskItem>) -> QueueResult<Vec<NodeId>> {
        self.mutate(|tree, context, _| {
            let mut ids = Vec::with_capacity(items.len());
            let mut events = Vec::new();

            for item in &items {
                let sample_node = resolve_task_sample(tree, item)?;
                let (id, added) = insert_task(tree, context, sample_node, item)?;
                ids.push(id);
                events.extend(added);
            }
            Ok((ids, events))
        })
        .await
    }

    /// Add one task to a sample, returning the new node (the group for interleaved tasks)
    pub async fn add_task(&self, sample_id: &str, item: TaskItem) -> QueueResult<NodeId> {
        self.mutate(|tree, context, _| {
            let sample_node = tree
                .find_sample(sample_id)
                .ok_or_else(|| QueueError::SampleNotFound(sample_id.to_string()))?;
            insert_task(tree, context, sample_node, &item)
        })
        .await
    }

    pub async fn add_data_collection(&self, sample_id: &str, parameters: Value) -> QueueResult<NodeId> {
        self.add_task(sample_id, TaskItem::new(TaskType::DataCollection, parameters))
            .await
    }

    pub async fn add_characterisation(
        &self,
        sample_id: &str,
        parameters: Value,
    ) -> QueueResult<NodeId> {
        self.add_task(sample_id, TaskItem::new(TaskType::Characterisation, parameters))
            .await
    }

    pub async fn add_workflow(
        &self,
        sample_id: &str,
        name: &str,
        parameters: Value,
    ) -> QueueResult<NodeId> {
        let mut item = TaskItem::new(TaskType::Workflow, parameters);
        item.name = Some(name.to_string());
        self.add_task(sample_id, item).await
    }

    pub async fn add_xrf_scan(&self, sample_id: &str, parameters: Value) -> QueueResult<NodeId> {
        self.add_task(sample_id, TaskItem::new(TaskType::XrfScan, parameters))
            .await
    }

    pub async fn add_energy_scan(&self, sample_id: &str, parameters: Value) -> QueueResult<NodeId> {
        self.add_task(sample_id, TaskItem::new(TaskType::EnergyScan, parameters))
            .await
    }

    pub async fn add_centring(&self, sample_id: &str, parameters: Value) -> QueueResult<NodeId> {
        self.add_task(sample_id, TaskItem::new(TaskType::SampleCentring, parameters))
            .await
    }

    /// Add an interleaved group; `taskIndexList` folds existing tasks into it
    pub async fn add_interleaved(&self, sample_id: &str, parameters: Value) -> QueueResult<NodeId> {
        self.add_task(sample_id, TaskItem::new(TaskType::Interleaved, parameters))
            .await
    }

    // Updating and removing

    /// Re-apply client parameters to a data collection or characterisation
    pub async fn update_task(&self, node_id: NodeId, item: TaskItem) -> QueueResult<()> {
        self.mutate(|tree, context, status| {
            ensure_not_executing(tree, status, node_id)?;

            let sample_node = tree
                .sample_of(node_id)
                .ok_or(QueueError::NotFound(node_id))?;
            let sample = tree.sample_data(sample_node)?.clone();
            let payload = tree.get(node_id)?.kind.as_task().cloned().ok_or_else(|| {
                QueueError::InvalidOperation(format!("node {} is not a task", node_id))
            })?;

            let updated = {
                let builder = ItemBuilder::new(context, tree, &sample);
                match payload {
                    TaskPayload::DataCollection(dc) => {
                        TaskPayload::DataCollection(update_collection(&builder, &dc, &item)?)
                    }
                    TaskPayload::Characterisation(ch) => {
                        let mut updated = builder.characterisation(&item)?;
                        updated.reference.path_template.run_number =
                            ch.reference.path_template.run_number;
                        updated.auto_add_diff_plan = ch.auto_add_diff_plan;
                        updated.diffraction_plan = ch.diffraction_plan;
                        TaskPayload::Characterisation(updated)
                    }
                    other => {
                        return Err(QueueError::InvalidOperation(format!(
                            "{} tasks cannot be updated",
                            other.task_type()
                        )));
                    }
                }
            };

            if let NodeKind::Task(task) = &mut tree.get_mut(node_id)?.kind {
                *task = updated;
            }

            let mut events = Vec::new();
            if tree.entry(node_id)?.enabled != item.checked {
                tree.set_enabled(node_id, item.checked)?;
                events.push(QueueEvent::EnabledChanged {
                    node_id,
                    enabled: item.checked,
                });
            }
            debug!("Updated parameters of node {}", node_id);
            Ok(((), events))
        })
        .await
    }

    /// Remove a node and its subtree; a task's now empty group goes with it
    pub async fn delete_node(&self, node_id: NodeId) -> QueueResult<Vec<NodeId>> {
        self.mutate(|tree, _, status| {
            ensure_not_executing(tree, status, node_id)?;

            let mut target = node_id;
            if let Some(parent) = tree.parent(node_id)? {
                let parent_node = tree.get(parent)?;
                if parent_node.kind.is_task_group()
                    && !parent_node.kind.is_interleaved()
                    && parent_node.children.len() == 1
                {
                    target = parent;
                }
            }

            let removed = tree.delete(target)?;
            Ok((
                removed,
                vec![QueueEvent::NodeRemoved { node_id: target }],
            ))
        })
        .await
    }

    /// Remove the task at a client index together with its group
    pub async fn delete_task_at(&self, sample_id: &str, task_index: usize) -> QueueResult<Vec<NodeId>> {
        self.mutate(|tree, _, status| {
            let sample_node = tree
                .find_sample(sample_id)
                .ok_or_else(|| QueueError::SampleNotFound(sample_id.to_string()))?;
            let tasks = tree.sample_tasks(sample_node)?;
            let task_id = *tasks.get(task_index).ok_or(QueueError::InvalidIndex {
                index: task_index,
                len: tasks.len(),
            })?;

            let container = container_of(tree, task_id)?;
            ensure_not_executing(tree, status, container)?;

            let removed = tree.delete(container)?;
            Ok((
                removed,
                vec![QueueEvent::NodeRemoved { node_id: container }],
            ))
        })
        .await
    }

    /// Remove every sample and task
    pub async fn clear(&self) -> QueueResult<()> {
        let mut state = self.inner.state.lock().await;
        if state.status.state.is_active() {
            return Err(QueueError::EngineBusy(state.status.state));
        }

        state.tree.clear();
        state.status.mounted_sample = None;
        drop(state);

        info!("Queue cleared");
        self.inner.emit(QueueEvent::QueueCleared);
        Ok(())
    }

    // Enable state

    pub async fn set_enabled(&self, node_id: NodeId, enabled: bool) -> QueueResult<()> {
        self.mutate(|tree, _, status| {
            ensure_not_executing(tree, status, node_id)?;
            tree.set_enabled(node_id, enabled)?;
            Ok(((), vec![QueueEvent::EnabledChanged { node_id, enabled }]))
        })
        .await
    }

    /// Set the flag of several nodes, all of which must exist
    pub async fn enable_items(&self, node_ids: &[NodeId], enabled: bool) -> QueueResult<()> {
        self.mutate(|tree, _, status| {
            if let Some(missing) = node_ids.iter().find(|id| !tree.contains(**id)) {
                return Err(QueueError::NotFound(*missing));
            }
            for node_id in node_ids {
                ensure_not_executing(tree, status, *node_id)?;
            }

            let mut events = Vec::with_capacity(node_ids.len());
            for node_id in node_ids {
                tree.set_enabled(*node_id, enabled)?;
                events.push(QueueEvent::EnabledChanged {
                    node_id: *node_id,
                    enabled,
                });
            }
            Ok(((), events))
        })
        .await
    }

    /// Flip a node's flag, returning the new value
    pub async fn toggle_node(&self, node_id: NodeId) -> QueueResult<bool> {
        self.mutate(|tree, _, status| {
            ensure_not_executing(tree, status, node_id)?;
            let enabled = tree.toggle(node_id)?;
            Ok((enabled, vec![QueueEvent::EnabledChanged { node_id, enabled }]))
        })
        .await
    }

    // Reordering

    /// Swap two tasks of a sample by client index
    pub async fn swap_task(&self, sample_id: &str, first: usize, second: usize) -> QueueResult<()> {
        self.mutate(|tree, _, _| {
            let sample_node = tree
                .find_sample(sample_id)
                .ok_or_else(|| QueueError::SampleNotFound(sample_id.to_string()))?;
            let (a, b) = (
                task_at(tree, sample_node, first)?,
                task_at(tree, sample_node, second)?,
            );

            let (container_a, container_b) = (container_of(tree, a)?, container_of(tree, b)?);
            let parent = if container_a == container_b {
                tree.swap_nodes(a, b)?;
                container_a
            } else {
                tree.swap_nodes(container_a, container_b)?;
                sample_node
            };
            Ok(((), vec![QueueEvent::QueueReordered { parent }]))
        })
        .await
    }

    /// Move a task of a sample from one client index to another
    pub async fn move_task(&self, sample_id: &str, from: usize, to: usize) -> QueueResult<()> {
        self.mutate(|tree, _, _| {
            let sample_node = tree
                .find_sample(sample_id)
                .ok_or_else(|| QueueError::SampleNotFound(sample_id.to_string()))?;
            let from_slot = container_slot(tree, sample_node, task_at(tree, sample_node, from)?)?;
            let to_slot = container_slot(tree, sample_node, task_at(tree, sample_node, to)?)?;

            tree.move_child(sample_node, from_slot, to_slot)?;
            Ok((
                (),
                vec![QueueEvent::QueueReordered {
                    parent: sample_node,
                }],
            ))
        })
        .await
    }

    pub async fn swap_nodes(&self, first: NodeId, second: NodeId) -> QueueResult<()> {
        self.mutate(|tree, _, _| {
            tree.swap_nodes(first, second)?;
            let parent = tree.parent(first)?.unwrap_or(ROOT_ID);
            Ok(((), vec![QueueEvent::QueueReordered { parent }]))
        })
        .await
    }

    pub async fn set_sample_order(&self, order: Vec<String>) -> QueueResult<()> {
        self.mutate(|tree, _, _| {
            tree.set_sample_order(&order)?;
            Ok(((), vec![QueueEvent::QueueReordered { parent: ROOT_ID }]))
        })
        .await
    }

    // Runtime flags

    pub async fn set_auto_mount_next(&self, enabled: bool) {
        self.inner.state.lock().await.context.auto_mount_next = enabled;
    }

    /// Set the flag in the context and on every characterisation
    pub async fn set_auto_add_diffplan(&self, enabled: bool) {
        let mut state = self.inner.state.lock().await;
        state.context.auto_add_diffplan = enabled;

        let ids: Vec<NodeId> = state.tree.nodes().map(|node| node.id).collect();
        for id in ids {
            if let Ok(node) = state.tree.get_mut(id)
                && let NodeKind::Task(TaskPayload::Characterisation(ch)) = &mut node.kind
            {
                ch.auto_add_diff_plan = enabled;
            }
        }
    }

    /// Set the user group folder, returning the sanitised value
    pub async fn set_group_folder(&self, path: &str) -> String {
        let folder = sanitize_group_folder(path);
        self.inner.state.lock().await.context.group_folder = folder.clone();
        folder
    }

    pub async fn set_num_snapshots(&self, count: u32) {
        self.inner.state.lock().await.context.num_snapshots = count;
    }

    /// Rebuild the on-disk run number table from a file listing
    pub async fn set_initial_file_list<I, S>(&self, paths: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let cache = RunNumberCache::from_paths(paths);
        self.inner.state.lock().await.context.run_numbers = cache;
    }

    /// Move a characterisation's pending diffraction plan into the queue
    pub async fn promote_diffraction_plan(&self, characterisation_id: NodeId) -> QueueResult<Vec<NodeId>> {
        self.mutate(|tree, _, _| {
            let promoted = promote_diffraction_plan(tree, characterisation_id)?;
            let sample_node = tree.sample_of(characterisation_id).unwrap_or(ROOT_ID);
            let events = promoted
                .iter()
                .map(|id| QueueEvent::TaskAdded {
                    node_id: *id,
                    sample_node,
                })
                .collect();
            Ok((promoted, events))
        })
        .await
    }

    // Persistence

    pub async fn save(&self, store: &dyn QueueStore, proposal_id: u64) -> QueueResult<()> {
        let blob = serde_json::to_string(&self.snapshot().await?)?;
        store.save(proposal_id, &blob).await
    }

    /// Replace the queue with a stored one, `None` when nothing was stored
    pub async fn load(&self, store: &dyn QueueStore, proposal_id: u64) -> QueueResult<Option<QueueSnapshot>> {
        let Some(blob) = store.load(proposal_id).await? else {
            return Ok(None);
        };
        let stored: StoredQueue = serde_json::from_str(&blob)?;
        self.load_stored(stored).await.map(Some)
    }

    /// Replace the queue with a snapshot in its JSON form
    pub async fn load_json(&self, json: &str) -> QueueResult<QueueSnapshot> {
        let stored: StoredQueue = serde_json::from_str(json)?;
        self.load_stored(stored).await
    }

    async fn load_stored(&self, mut stored: StoredQueue) -> QueueResult<QueueSnapshot> {
        let mut items = Vec::with_capacity(stored.samples.len());
        for sample_id in &stored.sample_order {
            match stored.samples.remove(sample_id) {
                Some(item) => items.push(item),
                None => warn!("Stored sample order names unknown sample {}", sample_id),
            }
        }
        if !stored.samples.is_empty() {
            warn!(
                "Ignoring {} stored samples missing from the sample order",
                stored.samples.len()
            );
        }

        // Node ids of a stored queue mean nothing in a fresh tree
        for item in &mut items {
            item.queue_id = None;
        }

        let loaded = self
            .mutate(|tree, context, status| {
                if status.state.is_active() {
                    return Err(QueueError::EngineBusy(status.state));
                }

                tree.clear();
                let mut events = vec![QueueEvent::QueueCleared];
                for item in &items {
                    let (_, added) = insert_sample_item(tree, context, item)?;
                    events.extend(added);
                }
                Ok((items.len(), events))
            })
            .await?;

        info!("Loaded queue with {} samples", loaded);
        self.snapshot().await
    }

    // Execution control

    /// Start a run over the whole queue, or over `target` alone when
    /// auto-mount is off. Returns the run id.
    pub async fn start(&self, target: Option<NodeId>) -> QueueResult<String> {
        let mut state = self.inner.state.lock().await;

        match state.status.state {
            ExecState::Failed => return Err(QueueError::EngineFailed),
            current if current.is_active() => return Err(QueueError::EngineBusy(current)),
            _ => {}
        }

        // A stopped run may still be unwinding
        if lock(&self.inner.worker)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
        {
            return Err(QueueError::EngineBusy(state.status.state));
        }

        let scope = match target {
            None => RunScope::Queue,
            Some(id) => {
                let kind = &state.tree.get(id)?.kind;
                if state.context.auto_mount_next {
                    RunScope::Queue
                } else {
                    match kind {
                        NodeKind::Root => RunScope::Queue,
                        NodeKind::Sample(_) => RunScope::Sample(id),
                        _ => RunScope::Subtree(id),
                    }
                }
            }
        };

        let run_id = Uuid::new_v4().to_string();
        let worker = Worker::new(
            Arc::clone(&self.inner),
            &state,
            scope,
            run_id.clone(),
            target,
        )?;

        state.status.state = ExecState::Running;
        state.status.run_id = Some(run_id.clone());
        state.status.current = None;
        state.status.executing = None;
        drop(state);

        self.inner.emit(QueueEvent::ExecutionStarted {
            run_id: run_id.clone(),
            target,
        });

        let handle = tokio::spawn(worker.run());
        *lock(&self.inner.worker) = Some(handle);

        Ok(run_id)
    }

    /// Pause at the next task boundary
    pub async fn pause(&self) -> QueueResult<()> {
        let mut state = self.inner.state.lock().await;
        match state.status.state {
            ExecState::Running => {
                state.status.state = ExecState::Paused;
                drop(state);
                info!("Queue execution paused");
                self.inner.emit(QueueEvent::ExecutionPaused);
                Ok(())
            }
            ExecState::Paused => Ok(()),
            other => Err(QueueError::InvalidOperation(format!(
                "cannot pause while {}",
                other
            ))),
        }
    }

    pub async fn resume(&self) -> QueueResult<()> {
        let mut state = self.inner.state.lock().await;
        match state.status.state {
            ExecState::Paused => {
                state.status.state = ExecState::Running;
                drop(state);
                info!("Queue execution resumed");
                self.inner.resume.notify_waiters();
                self.inner.emit(QueueEvent::ExecutionResumed);
                Ok(())
            }
            ExecState::Running => Ok(()),
            other => Err(QueueError::InvalidOperation(format!(
                "cannot resume while {}",
                other
            ))),
        }
    }

    /// Stop the run, interrupting the task in flight if there is one
    pub async fn stop(&self) -> QueueResult<()> {
        let interrupt = {
            let mut state = self.inner.state.lock().await;
            match state.status.state {
                ExecState::Running | ExecState::Paused => {
                    if state.status.executing.is_some() {
                        state.status.state = ExecState::Stopping;
                        true
                    } else {
                        state.status.state = ExecState::Stopped;
                        state.status.current = None;
                        self.inner
                            .emit(QueueEvent::ExecutionStopped { interrupted: None });
                        false
                    }
                }
                ExecState::Stopping => false,
                _ => return Ok(()),
            }
        };

        info!("Stopping queue execution");
        self.inner.resume.notify_waiters();
        if interrupt {
            self.inner.device.interrupt().await;
        }
        Ok(())
    }

    /// Return a failed or stopped engine to idle
    pub async fn reset(&self) -> QueueResult<()> {
        let mut state = self.inner.state.lock().await;
        match state.status.state {
            ExecState::Failed | ExecState::Stopped => {
                state.status.state = ExecState::Idle;
                state.status.current = None;
                state.status.executing = None;

                let running: Vec<NodeId> = state
                    .tree
                    .nodes()
                    .filter(|node| node.entry.status == EntryStatus::Running)
                    .map(|node| node.id)
                    .collect();
                for id in running {
                    state.tree.set_status(id, EntryStatus::Queued)?;
                }
                Ok(())
            }
            ExecState::Idle => Ok(()),
            other => Err(QueueError::EngineBusy(other)),
        }
    }

    /// Wait for the current run to end
    pub async fn wait(&self) -> QueueResult<RunSummary> {
        let handle = lock(&self.inner.worker).take();

        match handle {
            Some(handle) => handle.await.map_err(|e| {
                QueueError::InvalidOperation(format!("execution worker ended abnormally: {}", e))
            })?,
            None => self
                .inner
                .state
                .lock()
                .await
                .status
                .last_summary
                .clone()
                .ok_or_else(|| QueueError::InvalidOperation("no run has been started".to_string())),
        }
    }
}

fn ensure_not_executing(tree: &QueueTree, status: &ExecutionStatus, node_id: NodeId) -> QueueResult<()> {
    for active in [status.executing, status.current].into_iter().flatten() {
        if active == node_id || tree.descendants(node_id)?.contains(&active) {
            debug!("Node {} is executing, refusing to change it", active);
            return Err(QueueError::EngineBusy(status.state));
        }
    }
    Ok(())
}

/// The sample child holding a client task: its group, or the interleaved group itself
fn container_of(tree: &QueueTree, task_id: NodeId) -> QueueResult<NodeId> {
    if tree.get(task_id)?.kind.is_task_group() {
        return Ok(task_id);
    }
    tree.parent(task_id)?.ok_or(QueueError::NotFound(task_id))
}

fn container_slot(tree: &QueueTree, sample_node: NodeId, task_id: NodeId) -> QueueResult<usize> {
    let container = container_of(tree, task_id)?;
    tree.children(sample_node)?
        .iter()
        .position(|id| *id == container)
        .ok_or(QueueError::NotFound(container))
}

fn task_at(tree: &QueueTree, sample_node: NodeId, index: usize) -> QueueResult<NodeId> {
    let tasks = tree.sample_tasks(sample_node)?;
    tasks.get(index).copied().ok_or(QueueError::InvalidIndex {
        index,
        len: tasks.len(),
    })
}

fn resolve_task_sample(tree: &QueueTree, item: &TaskItem) -> QueueResult<NodeId> {
    if let Some(id) = item.sample_queue_id
        && tree.get(id).is_ok_and(|node| node.kind.is_sample())
    {
        return Ok(id);
    }

    match &item.sample_id {
        Some(sample_id) => tree
            .find_sample(sample_id)
            .ok_or_else(|| QueueError::SampleNotFound(sample_id.clone())),
        None => Err(QueueError::InvalidItem(format!(
            "{} task names no sample",
            item.task_type
        ))),
    }
}

fn entry_for(checked: bool) -> Entry {
    if checked {
        Entry::default()
    } else {
        Entry::disabled()
    }
}

/// Add a sample item, or re-enable the sample it names, then its tasks
fn insert_sample_item(
    tree: &mut QueueTree,
    context: &QueueContext,
    item: &SampleItem,
) -> QueueResult<(NodeId, Vec<QueueEvent>)> {
    let mut events = Vec::new();

    let known = item
        .queue_id
        .filter(|id| tree.get(*id).is_ok_and(|node| node.kind.is_sample()))
        .or_else(|| tree.find_sample(&item.sample_id));

    let sample_node = match known {
        Some(id) => {
            if item.checked && !tree.entry(id)?.enabled {
                tree.set_enabled(id, true)?;
                events.push(QueueEvent::EnabledChanged {
                    node_id: id,
                    enabled: true,
                });
            }
            id
        }
        None => {
            let data = item.to_sample_data()?;
            let id = tree.add_child_with_entry(
                ROOT_ID,
                NodeKind::Sample(data),
                entry_for(item.checked),
            )?;
            events.push(QueueEvent::SampleAdded {
                node_id: id,
                sample_id: item.sample_id.clone(),
            });
            id
        }
    };

    for task in &item.tasks {
        let (_, added) = insert_task(tree, context, sample_node, task)?;
        events.extend(added);
    }

    Ok((sample_node, events))
}

/// Add one task under a sample, each in its own task group
fn insert_task(
    tree: &mut QueueTree,
    context: &QueueContext,
    sample_node: NodeId,
    item: &TaskItem,
) -> QueueResult<(NodeId, Vec<QueueEvent>)> {
    if item.task_type == TaskType::Interleaved {
        return insert_interleaved(tree, context, sample_node, item);
    }

    let sample = tree.sample_data(sample_node)?.clone();
    let payload = ItemBuilder::new(context, tree, &sample).build(item)?;

    let group = tree.add_child_with_entry(
        sample_node,
        NodeKind::TaskGroup(TaskGroupData::default()),
        entry_for(item.checked),
    )?;
    let id = tree.add_child_with_entry(group, NodeKind::Task(payload), entry_for(item.checked))?;
    tree.recompute_ancestors(id)?;

    Ok((
        id,
        vec![QueueEvent::TaskAdded {
            node_id: id,
            sample_node,
        }],
    ))
}

fn insert_interleaved(
    tree: &mut QueueTree,
    context: &QueueContext,
    sample_node: NodeId,
    item: &TaskItem,
) -> QueueResult<(NodeId, Vec<QueueEvent>)> {
    let request = InterleavedRequest::from_item(item)?;
    let sample = tree.sample_data(sample_node)?.clone();

    let mut absorbed_tasks = Vec::new();
    let mut absorbed_slots = Vec::new();
    if let Some(indices) = &request.absorbed {
        let mut indices = indices.clone();
        indices.sort_unstable();
        indices.dedup();

        for index in indices {
            let task_id = task_at(tree, sample_node, index)?;
            let slot = container_slot(tree, sample_node, task_id)?;
            if !absorbed_slots.contains(&slot) {
                absorbed_slots.push(slot);
            }
            absorbed_tasks.push(task_id);
        }
    }

    let wedges = {
        let builder = ItemBuilder::new(context, tree, &sample);

        let wedge_items = if request.wedges.is_empty() {
            absorbed_tasks
                .iter()
                .map(|id| match &tree.get(*id)?.kind {
                    NodeKind::Task(TaskPayload::DataCollection(dc)) => Ok(builder.wedge_item_from(dc)),
                    other => Err(QueueError::InvalidItem(format!(
                        "{} cannot become an interleaved wedge",
                        other.describe()
                    ))),
                })
                .collect::<QueueResult<Vec<_>>>()?
        } else {
            request.wedges.clone()
        };

        if wedge_items.is_empty() {
            return Err(QueueError::InvalidItem(
                "interleaved task needs at least one wedge".to_string(),
            ));
        }

        wedge_items
            .iter()
            .enumerate()
            .map(|(index, wedge)| Ok((builder.wedge(wedge, index + 1)?, wedge.checked)))
            .collect::<QueueResult<Vec<_>>>()?
    };

    let group = tree.add_child_with_entry(
        sample_node,
        NodeKind::TaskGroup(TaskGroupData::interleaved(request.sub_wedge_size)),
        entry_for(item.checked),
    )?;
    for (dc, checked) in wedges {
        tree.add_child_with_entry(
            group,
            NodeKind::Task(TaskPayload::DataCollection(dc)),
            entry_for(checked && item.checked),
        )?;
    }
    if let Some(first_wedge) = tree.children(group)?.first().copied() {
        tree.recompute_ancestors(first_wedge)?;
    }

    let mut events = vec![QueueEvent::TaskAdded {
        node_id: group,
        sample_node,
    }];

    if !absorbed_slots.is_empty() {
        let interleaved_index = tree.children(sample_node)?.len() - 1;
        let removed = tree.merge_interleaved(sample_node, interleaved_index, &absorbed_slots)?;
        events.extend(
            removed
                .into_iter()
                .map(|node_id| QueueEvent::NodeRemoved { node_id }),
        );
        events.push(QueueEvent::QueueReordered {
            parent: sample_node,
        });
    }

    Ok((group, events))
}
