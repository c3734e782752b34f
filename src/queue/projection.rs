//! Client view of the queue tree.
//!
//! Everything here is computed on demand from the tree and the queue
//! context; nothing in a view is stored back into the tree.

use crate::env;
use crate::error::{QueueError, QueueResult};
use crate::queue::context::QueueContext;
use crate::queue::path::PathTemplate;
use crate::queue::tree::QueueTree;
use crate::queue::types::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;

/// One task as shown to clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    pub label: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub parameters: Value,
    #[serde(rename = "sampleID")]
    pub sample_id: String,
    #[serde(rename = "sampleQueueID")]
    pub sample_queue_id: NodeId,
    pub task_index: Option<usize>,
    #[serde(rename = "queueID")]
    pub queue_id: NodeId,
    pub checked: bool,
    pub state: NodeState,
    pub progress: f64,
    #[serde(
        rename = "limsResultData",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub lims_result_data: Option<Value>,
    #[serde(
        rename = "diffractionPlan",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub diffraction_plan: Option<Vec<TaskView>>,
    #[serde(
        rename = "diffractionPlanID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub diffraction_plan_id: Option<i64>,
    #[serde(
        rename = "isDiffractionPlan",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub is_diffraction_plan: Option<bool>,
}

impl TaskView {
    /// Number of images the task will take, when it takes any
    pub fn num_images(&self) -> Option<u32> {
        self.parameters
            .get("num_images")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
    }
}

/// One sample with its tasks as shown to clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SampleView {
    #[serde(rename = "sampleID")]
    pub sample_id: String,
    #[serde(rename = "queueID")]
    pub queue_id: NodeId,
    pub code: String,
    pub location: String,
    pub sample_name: String,
    pub protein_acronym: String,
    #[serde(rename = "limsID", default, skip_serializing_if = "Option::is_none")]
    pub lims_id: Option<i64>,
    pub default_prefix: String,
    pub default_sub_dir: String,
    #[serde(rename = "type")]
    pub view_type: String,
    pub checked: bool,
    pub state: NodeState,
    pub tasks: Vec<TaskView>,
}

/// Ordered projection of the whole queue, also the persisted blob
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueueSnapshot {
    pub sample_order: Vec<String>,
    #[serde(flatten)]
    pub samples: BTreeMap<String, SampleView>,
}

impl QueueSnapshot {
    /// Samples in queue order
    pub fn ordered(&self) -> impl Iterator<Item = &SampleView> {
        self.sample_order
            .iter()
            .filter_map(|sample_id| self.samples.get(sample_id))
    }

    pub fn task_count(&self) -> usize {
        self.samples.values().map(|sample| sample.tasks.len()).sum()
    }
}

/// Coarse queue status reported to clients
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum QueueStatus {
    QueueRunning,
    QueuePaused,
    QueueStopped,
    QueueFailed,
}

/// Queue status record with the runtime flags clients display
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueStateRecord {
    pub current: Option<String>,
    pub auto_mount_next: bool,
    pub auto_add_diff_plan: bool,
    pub num_snapshots: u32,
    pub group_folder: String,
    #[serde(rename = "sample_order")]
    pub sample_order: Vec<String>,
    pub queue_status: QueueStatus,
}

/// Read-only projection over a tree.
///
/// `running` is the engine's current entry: a leaf task, or an interleaved
/// group while its wedges run.
pub struct Projector<'a> {
    tree: &'a QueueTree,
    context: &'a QueueContext,
    running: Option<NodeId>,
}

impl<'a> Projector<'a> {
    pub fn new(tree: &'a QueueTree, context: &'a QueueContext, running: Option<NodeId>) -> Self {
        Self {
            tree,
            context,
            running,
        }
    }

    pub fn project(&self) -> QueueResult<QueueSnapshot> {
        let mut snapshot = QueueSnapshot::default();

        for sample_id in self.tree.samples() {
            let view = self.sample_view(*sample_id)?;
            snapshot.sample_order.push(view.sample_id.clone());
            snapshot.samples.insert(view.sample_id.clone(), view);
        }

        Ok(snapshot)
    }

    pub fn queue_state(&self, status: QueueStatus, current: Option<String>) -> QueueStateRecord {
        QueueStateRecord {
            current,
            auto_mount_next: self.context.auto_mount_next,
            auto_add_diff_plan: self.context.auto_add_diffplan,
            num_snapshots: self.context.num_snapshots,
            group_folder: self.context.group_folder.clone(),
            sample_order: self.sample_order(),
            queue_status: status,
        }
    }

    /// Client sample ids in queue order
    pub fn sample_order(&self) -> Vec<String> {
        self.tree
            .samples()
            .iter()
            .filter_map(|id| self.tree.sample_data(*id).ok())
            .map(|sample| sample.sample_id.clone())
            .collect()
    }

    pub fn sample_view(&self, sample_node: NodeId) -> QueueResult<SampleView> {
        let sample = self.tree.sample_data(sample_node)?;
        let tasks = self
            .tree
            .sample_tasks(sample_node)?
            .into_iter()
            .map(|task_id| self.task_view(task_id))
            .collect::<QueueResult<Vec<_>>>()?;

        Ok(SampleView {
            sample_id: sample.sample_id.clone(),
            queue_id: sample_node,
            code: sample.code.clone(),
            location: sample.location.to_string(),
            sample_name: sample.name.clone(),
            protein_acronym: sample.protein_acronym.clone(),
            lims_id: sample.lims_id,
            default_prefix: sample.default_prefix(),
            default_sub_dir: sample.default_subdir(),
            view_type: "Sample".to_string(),
            checked: self.tree.entry(sample_node)?.enabled,
            state: self.sample_state(sample_node)?,
            tasks,
        })
    }

    /// View of a leaf task or an interleaved group
    pub fn task_view(&self, node_id: NodeId) -> QueueResult<TaskView> {
        let node = self.tree.get(node_id)?;
        let sample_node = self
            .tree
            .sample_of(node_id)
            .ok_or(QueueError::NotFound(node_id))?;
        let sample_id = self.tree.sample_data(sample_node)?.sample_id.clone();
        let task_index = self
            .tree
            .sample_tasks(sample_node)?
            .iter()
            .position(|id| *id == node_id);

        let mut view = TaskView {
            label: String::new(),
            task_type: TaskType::DataCollection,
            name: None,
            parameters: Value::Null,
            sample_id,
            sample_queue_id: sample_node,
            task_index,
            queue_id: node_id,
            checked: node.entry.enabled,
            state: self.node_state(node_id)?,
            progress: self.progress(node_id)?,
            lims_result_data: self
                .context
                .lims_link(node_id)
                .map(|link| json!({ "limsTaskLink": link })),
            diffraction_plan: None,
            diffraction_plan_id: None,
            is_diffraction_plan: None,
        };

        match &node.kind {
            NodeKind::TaskGroup(group) => {
                let sub_wedge_size = group.interleave.ok_or_else(|| {
                    QueueError::InvalidOperation(format!(
                        "node {} is a plain task group, not a task",
                        node_id
                    ))
                })?;
                let wedges = node
                    .children
                    .iter()
                    .map(|wedge_id| {
                        self.task_view(*wedge_id)
                            .and_then(|wedge| Ok(serde_json::to_value(wedge)?))
                    })
                    .collect::<QueueResult<Vec<_>>>()?;

                view.label = TaskType::Interleaved.label().to_string();
                view.task_type = TaskType::Interleaved;
                view.parameters = json!({
                    "wedges": wedges,
                    "swNumImages": sub_wedge_size,
                });
            }
            NodeKind::Task(payload) => {
                view.task_type = payload.task_type();
                view.label = payload.task_type().label().to_string();
                self.fill_task(&mut view, node, payload);
            }
            other => {
                return Err(QueueError::InvalidOperation(format!(
                    "{} has no task view",
                    other.describe()
                )));
            }
        }

        Ok(view)
    }

    fn fill_task(&self, view: &mut TaskView, node: &QueueNode, payload: &TaskPayload) {
        match payload {
            TaskPayload::DataCollection(dc) => {
                view.parameters = Value::Object(self.collection_parameters(dc));
            }
            TaskPayload::Characterisation(ch) => {
                let mut parameters = self.collection_parameters(&ch.reference);
                if let Ok(Value::Object(strategy)) = serde_json::to_value(&ch.parameters) {
                    parameters.extend(strategy);
                }
                parameters.insert("auto_add_diff_plan".into(), ch.auto_add_diff_plan.into());
                view.parameters = Value::Object(parameters);

                view.diffraction_plan = Some(
                    ch.diffraction_plan
                        .iter()
                        .map(|dc| self.diffraction_plan_view(view, dc))
                        .collect(),
                );
                view.diffraction_plan_id = Some(if ch.diffraction_plan.is_empty() {
                    env::NO_DIFFRACTION_PLAN_ID
                } else {
                    node.id as i64
                });
            }
            TaskPayload::Workflow(wf) => {
                let mut parameters = self.path_parameters(&wf.path_template);
                parameters.extend(wf.parameters.clone());
                view.parameters = Value::Object(parameters);
                view.label = wf.label.clone();
                view.name = Some(wf.name.clone());
            }
            TaskPayload::XrfScan(xrf) => {
                let mut parameters = self.path_parameters(&xrf.path_template);
                parameters.insert("countTime".into(), xrf.count_time.into());
                parameters.insert("shape".into(), xrf.shape.clone().into());
                view.parameters = Value::Object(parameters);
            }
            TaskPayload::EnergyScan(es) => {
                let mut parameters = self.path_parameters(&es.path_template);
                parameters.insert("element".into(), es.element.clone().into());
                parameters.insert("edge".into(), es.edge.clone().into());
                view.parameters = Value::Object(parameters);
            }
            TaskPayload::SampleCentring(centring) => {
                view.parameters = Value::Object(centring.parameters.clone());
            }
        }

        if node.origin.is_some() {
            view.is_diffraction_plan = Some(true);
        }
    }

    fn diffraction_plan_view(&self, owner: &TaskView, dc: &DataCollectionData) -> TaskView {
        TaskView {
            label: TaskType::DataCollection.label().to_string(),
            task_type: TaskType::DataCollection,
            name: None,
            parameters: Value::Object(self.collection_parameters(dc)),
            sample_id: owner.sample_id.clone(),
            sample_queue_id: owner.sample_queue_id,
            task_index: None,
            queue_id: owner.queue_id,
            checked: false,
            state: NodeState::Uncollected,
            progress: 0.0,
            lims_result_data: None,
            diffraction_plan: None,
            diffraction_plan_id: None,
            is_diffraction_plan: Some(true),
        }
    }

    fn path_parameters(&self, template: &PathTemplate) -> Map<String, Value> {
        let mut parameters = template.to_parameters(&self.context.raw_data_folder_name);

        // Reported relative to the group folder so it can be resubmitted as is
        let subdir = template.subdir(&self.context.raw_data_folder_name);
        let group = self.context.group_folder.trim_matches('/');
        if !group.is_empty()
            && let Some(rest) = subdir.strip_prefix(group)
        {
            parameters.insert("subdir".into(), rest.trim_start_matches('/').into());
        }

        parameters
    }

    fn collection_parameters(&self, dc: &DataCollectionData) -> Map<String, Value> {
        let mut parameters = self.path_parameters(&dc.path_template);
        if let Ok(Value::Object(acquisition)) = serde_json::to_value(&dc.acquisition) {
            parameters.extend(acquisition);
        }
        parameters.insert(
            "helical".into(),
            (dc.experiment_type == ExperimentType::Helical).into(),
        );
        parameters.insert(
            "mesh".into(),
            (dc.experiment_type == ExperimentType::Mesh).into(),
        );
        parameters.insert("shape".into(), dc.shape.clone().into());
        parameters
    }

    fn is_running(&self, node: &QueueNode) -> bool {
        match self.running {
            Some(current) => current == node.id || Some(current) == node.parent,
            None => false,
        }
    }

    /// Failed before Collected before Running before Uncollected
    pub fn node_state(&self, node_id: NodeId) -> QueueResult<NodeState> {
        let node = self.tree.get(node_id)?;

        let state = if node.entry.status == EntryStatus::Failed {
            NodeState::Failed
        } else if node.entry.executed {
            NodeState::Collected
        } else if self.is_running(node) {
            NodeState::Running
        } else {
            NodeState::Uncollected
        };

        Ok(state)
    }

    /// Aggregate state of a sample over the leaves under its groups.
    ///
    /// Leaves that are disabled and never ran do not hold the sample back
    /// from `Collected`.
    pub fn sample_state(&self, sample_node: NodeId) -> QueueResult<NodeState> {
        let mut states = Vec::new();
        for leaf in self.tree.leaves_of(sample_node)? {
            let entry = self.tree.entry(leaf)?;
            let state = self.node_state(leaf)?;
            if entry.enabled || state != NodeState::Uncollected {
                states.push(state);
            }
        }

        let state = if states.contains(&NodeState::Running) {
            NodeState::Running
        } else if states.contains(&NodeState::Failed) {
            NodeState::Failed
        } else if !states.is_empty() && states.iter().all(|s| *s == NodeState::Collected) {
            NodeState::Collected
        } else {
            NodeState::Uncollected
        };

        Ok(state)
    }

    /// Completion fraction of a task or interleaved group, in `[0, 1]`
    pub fn progress(&self, node_id: NodeId) -> QueueResult<f64> {
        let node = self.tree.get(node_id)?;
        if node.entry.executed {
            return Ok(1.0);
        }

        let fraction = match &node.kind {
            NodeKind::TaskGroup(group) => match (group.interleave, node.progress.current_wedge) {
                (Some(sub_wedge_size), Some(index)) if !node.children.is_empty() => {
                    let total = node.children.len() as f64 * sub_wedge_size as f64;
                    (index as f64 + 1.0) * sub_wedge_size as f64 / total
                }
                _ => 0.0,
            },
            NodeKind::Task(TaskPayload::DataCollection(dc)) => {
                image_fraction(node.progress.images_taken, dc.acquisition.num_images)
            }
            NodeKind::Task(TaskPayload::Characterisation(ch)) => image_fraction(
                node.progress.images_taken,
                ch.reference.acquisition.num_images.saturating_mul(2),
            ),
            _ => 0.0,
        };

        Ok(fraction.clamp(0.0, 1.0))
    }
}

fn image_fraction(taken: u32, total: u32) -> f64 {
    if total == 0 {
        0.0
    } else {
        taken as f64 / total as f64
    }
}
