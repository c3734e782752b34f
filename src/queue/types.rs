use crate::env;
use crate::queue::path::PathTemplate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for queue nodes, assigned monotonically and never reused
pub type NodeId = u64;

/// Identifier of the queue root, which always exists
pub const ROOT_ID: NodeId = 0;

/// Runtime status of a node's entry
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EntryStatus {
    #[default]
    Queued,
    Running,
    Success,
    Failed,
}

/// Runtime flags carried by every node alongside its model data
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub enabled: bool,
    pub executed: bool,
    pub status: EntryStatus,
}

impl Default for Entry {
    fn default() -> Self {
        Self {
            enabled: true,
            executed: false,
            status: EntryStatus::Queued,
        }
    }
}

impl Entry {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Client-facing state of a node, serialized as the numeric flags clients expect
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(into = "u8", try_from = "u8")]
pub enum NodeState {
    Uncollected,
    Running,
    Failed,
    Collected,
}

impl From<NodeState> for u8 {
    fn from(state: NodeState) -> u8 {
        match state {
            NodeState::Uncollected => 0x0,
            NodeState::Running => 0x1,
            NodeState::Failed => 0x2,
            NodeState::Collected => 0x4,
        }
    }
}

impl TryFrom<u8> for NodeState {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(NodeState::Uncollected),
            0x1 => Ok(NodeState::Running),
            0x2 => Ok(NodeState::Failed),
            0x4 => Ok(NodeState::Collected),
            other => Err(format!("unknown node state {}", other)),
        }
    }
}

/// Where a sample sits: a sample changer slot or a manually mounted pin
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum SampleLocation {
    Slot { basket: u32, position: u32 },
    Manual,
}

impl SampleLocation {
    /// Parse a `basket:position` address, or the `Manual` marker
    pub fn parse(location: &str) -> Option<Self> {
        if location.is_empty() || location == "Manual" {
            return Some(SampleLocation::Manual);
        }

        let (basket, position) = location.split_once(':')?;
        Some(SampleLocation::Slot {
            basket: basket.trim().parse().ok()?,
            position: position.trim().parse().ok()?,
        })
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, SampleLocation::Manual)
    }
}

impl fmt::Display for SampleLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleLocation::Slot { basket, position } => write!(f, "{}:{:02}", basket, position),
            SampleLocation::Manual => write!(f, "Manual"),
        }
    }
}

/// Sample metadata, used for projection and naming only
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SampleData {
    /// Client-visible sample identifier, usually the changer location
    pub sample_id: String,
    pub name: String,
    pub location: SampleLocation,
    pub code: String,
    pub protein_acronym: String,
    pub lims_id: Option<i64>,
}

impl SampleData {
    /// Default file prefix, `{acronym}-{name}` when LIMS metadata is available
    pub fn default_prefix(&self) -> String {
        match (self.protein_acronym.is_empty(), self.name.is_empty()) {
            (false, false) => format!("{}-{}", self.protein_acronym, self.name),
            (true, false) => self.name.clone(),
            _ => env::DEFAULT_LOCAL_PREFIX.to_string(),
        }
    }

    /// Default sub-directory, `{acronym}/{acronym}-{name}` when possible
    pub fn default_subdir(&self) -> String {
        match (self.protein_acronym.is_empty(), self.name.is_empty()) {
            (false, false) => format!(
                "{}/{}-{}",
                self.protein_acronym, self.protein_acronym, self.name
            ),
            (true, false) => self.name.clone(),
            _ => String::new(),
        }
    }
}

/// Task group payload; an interleaved group carries its sub-wedge size
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct TaskGroupData {
    pub interleave: Option<u32>,
}

impl TaskGroupData {
    pub fn interleaved(sub_wedge_size: u32) -> Self {
        Self {
            interleave: Some(sub_wedge_size),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentType {
    #[default]
    Native,
    Helical,
    Mesh,
}

/// Acquisition parameters of a single collection
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AcquisitionParameters {
    pub first_image: u32,
    pub num_images: u32,
    pub osc_start: f64,
    pub osc_range: f64,
    pub overlap: f64,
    pub kappa: f64,
    pub kappa_phi: f64,
    pub exp_time: f64,
    pub num_passes: u32,
    pub resolution: f64,
    pub energy: f64,
    pub transmission: f64,
    pub shutterless: bool,
    pub detector_mode: String,
    pub inverse_beam: bool,
    pub take_dark_current: bool,
    pub skip_existing_images: bool,
    pub take_snapshots: bool,
}

impl Default for AcquisitionParameters {
    fn default() -> Self {
        Self {
            first_image: 1,
            num_images: 1,
            osc_start: 0.0,
            osc_range: 0.1,
            overlap: 0.0,
            kappa: 0.0,
            kappa_phi: 0.0,
            exp_time: 0.05,
            num_passes: 1,
            resolution: 2.0,
            energy: 12.4,
            transmission: 100.0,
            shutterless: true,
            detector_mode: String::new(),
            inverse_beam: false,
            take_dark_current: true,
            skip_existing_images: false,
            take_snapshots: true,
        }
    }
}

/// A single data collection, also used for characterisation references,
/// interleaved wedges and diffraction plan collections
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct DataCollectionData {
    pub path_template: PathTemplate,
    pub acquisition: AcquisitionParameters,
    pub experiment_type: ExperimentType,
    pub shape: String,
}

/// Strategy parameters handed to data analysis after the reference pass
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct CharacterisationParameters {
    pub strategy_complexity: u32,
    pub account_rad_damage: bool,
    pub opt_sad: bool,
    pub space_group: String,
    pub use_aimed_resolution: bool,
    pub aimed_resolution: f64,
    pub use_aimed_multiplicity: bool,
    pub aimed_multiplicity: f64,
    pub min_crystal_vdim: f64,
    pub max_crystal_vdim: f64,
}

impl Default for CharacterisationParameters {
    fn default() -> Self {
        Self {
            strategy_complexity: 0,
            account_rad_damage: true,
            opt_sad: false,
            space_group: String::new(),
            use_aimed_resolution: false,
            aimed_resolution: 1.0,
            use_aimed_multiplicity: false,
            aimed_multiplicity: 4.0,
            min_crystal_vdim: 0.0,
            max_crystal_vdim: 0.0,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct CharacterisationData {
    /// Internal reference collection, executed as part of the characterisation
    pub reference: DataCollectionData,
    pub parameters: CharacterisationParameters,
    pub auto_add_diff_plan: bool,
    /// Collections proposed by data analysis, filled after device feedback
    pub diffraction_plan: Vec<DataCollectionData>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct WorkflowData {
    pub label: String,
    /// Workflow type as known by the workflow engine
    pub name: String,
    pub path_template: PathTemplate,
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct XrfScanData {
    pub path_template: PathTemplate,
    pub count_time: f64,
    pub shape: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct EnergyScanData {
    pub path_template: PathTemplate,
    pub element: String,
    pub edge: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct SampleCentringData {
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

/// Closed set of leaf task kinds
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum TaskPayload {
    DataCollection(DataCollectionData),
    Characterisation(CharacterisationData),
    Workflow(WorkflowData),
    XrfScan(XrfScanData),
    EnergyScan(EnergyScanData),
    SampleCentring(SampleCentringData),
}

impl TaskPayload {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskPayload::DataCollection(_) => TaskType::DataCollection,
            TaskPayload::Characterisation(_) => TaskType::Characterisation,
            TaskPayload::Workflow(_) => TaskType::Workflow,
            TaskPayload::XrfScan(_) => TaskType::XrfScan,
            TaskPayload::EnergyScan(_) => TaskType::EnergyScan,
            TaskPayload::SampleCentring(_) => TaskType::SampleCentring,
        }
    }

    /// Path templates of this task, including characterisation references
    /// and pending diffraction plan collections
    pub fn path_templates(&self) -> Vec<&PathTemplate> {
        match self {
            TaskPayload::DataCollection(dc) => vec![&dc.path_template],
            TaskPayload::Characterisation(ch) => std::iter::once(&ch.reference.path_template)
                .chain(ch.diffraction_plan.iter().map(|dc| &dc.path_template))
                .collect(),
            TaskPayload::Workflow(wf) => vec![&wf.path_template],
            TaskPayload::XrfScan(xrf) => vec![&xrf.path_template],
            TaskPayload::EnergyScan(es) => vec![&es.path_template],
            TaskPayload::SampleCentring(_) => Vec::new(),
        }
    }
}

/// Client-facing task type names
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskType {
    DataCollection,
    Characterisation,
    Workflow,
    #[serde(rename = "XRFScan")]
    XrfScan,
    EnergyScan,
    SampleCentring,
    Interleaved,
}

impl TaskType {
    pub fn label(&self) -> &'static str {
        match self {
            TaskType::DataCollection => "Data Collection",
            TaskType::Characterisation => "Characterisation",
            TaskType::Workflow => "Workflow",
            TaskType::XrfScan => "XRF Scan",
            TaskType::EnergyScan => "Energy Scan",
            TaskType::SampleCentring => "Centring",
            TaskType::Interleaved => "Interleaved",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::DataCollection => "DataCollection",
            TaskType::Characterisation => "Characterisation",
            TaskType::Workflow => "Workflow",
            TaskType::XrfScan => "XRFScan",
            TaskType::EnergyScan => "EnergyScan",
            TaskType::SampleCentring => "SampleCentring",
            TaskType::Interleaved => "Interleaved",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific payload of a node
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum NodeKind {
    Root,
    Sample(SampleData),
    TaskGroup(TaskGroupData),
    Task(TaskPayload),
}

impl NodeKind {
    pub fn is_sample(&self) -> bool {
        matches!(self, NodeKind::Sample(_))
    }

    pub fn is_task_group(&self) -> bool {
        matches!(self, NodeKind::TaskGroup(_))
    }

    /// Sub-wedge size when this is an interleaved group
    pub fn interleave(&self) -> Option<u32> {
        match self {
            NodeKind::TaskGroup(group) => group.interleave,
            _ => None,
        }
    }

    pub fn is_interleaved(&self) -> bool {
        self.interleave().is_some()
    }

    pub fn as_sample(&self) -> Option<&SampleData> {
        match self {
            NodeKind::Sample(sample) => Some(sample),
            _ => None,
        }
    }

    pub fn as_task(&self) -> Option<&TaskPayload> {
        match self {
            NodeKind::Task(task) => Some(task),
            _ => None,
        }
    }

    pub fn as_task_mut(&mut self) -> Option<&mut TaskPayload> {
        match self {
            NodeKind::Task(task) => Some(task),
            _ => None,
        }
    }

    /// Short description used in log messages
    pub fn describe(&self) -> String {
        match self {
            NodeKind::Root => "root".to_string(),
            NodeKind::Sample(sample) => format!("sample {}", sample.sample_id),
            NodeKind::TaskGroup(group) => match group.interleave {
                Some(size) => format!("interleaved group (sub-wedge {})", size),
                None => "task group".to_string(),
            },
            NodeKind::Task(task) => task.task_type().as_str().to_string(),
        }
    }
}

/// Progress counters updated from device events
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ProgressData {
    pub images_taken: u32,
    /// Index of the wedge in flight, interleaved groups only
    pub current_wedge: Option<usize>,
}

/// One node of the queue tree, model and runtime fields together
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct QueueNode {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub kind: NodeKind,
    pub entry: Entry,
    pub progress: ProgressData,
    /// Characterisation a diffraction plan collection was derived from
    pub origin: Option<NodeId>,
}

impl QueueNode {
    pub fn new(id: NodeId, parent: Option<NodeId>, kind: NodeKind) -> Self {
        Self {
            id,
            parent,
            children: Vec::new(),
            kind,
            entry: Entry::default(),
            progress: ProgressData::default(),
            origin: None,
        }
    }

    pub fn is_leaf_task(&self) -> bool {
        matches!(self.kind, NodeKind::Task(_))
    }
}
