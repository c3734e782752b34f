//! Client-submitted queue items and their conversion into node payloads.
//!
//! Items use the same camelCase layout as the projection, so a persisted
//! snapshot can be fed straight back into the queue.

use crate::env;
use crate::error::{QueueError, QueueResult};
use crate::queue::context::QueueContext;
use crate::queue::path::PathTemplate;
use crate::queue::tree::QueueTree;
use crate::queue::types::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

fn default_checked() -> bool {
    true
}

/// A sample with its tasks, as submitted by a client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SampleItem {
    #[serde(rename = "sampleID")]
    pub sample_id: String,
    #[serde(rename = "queueID", default)]
    pub queue_id: Option<NodeId>,
    #[serde(default)]
    pub sample_name: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub protein_acronym: String,
    #[serde(rename = "limsID", default)]
    pub lims_id: Option<i64>,
    #[serde(default = "default_checked")]
    pub checked: bool,
    #[serde(default)]
    pub tasks: Vec<TaskItem>,
}

impl SampleItem {
    pub fn new(sample_id: impl Into<String>, name: impl Into<String>) -> Self {
        let sample_id = sample_id.into();
        Self {
            location: sample_id.clone(),
            sample_id,
            queue_id: None,
            sample_name: name.into(),
            code: String::new(),
            protein_acronym: String::new(),
            lims_id: None,
            checked: true,
            tasks: Vec::new(),
        }
    }

    pub fn with_task(mut self, task: TaskItem) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn to_sample_data(&self) -> QueueResult<SampleData> {
        let location = SampleLocation::parse(&self.location).ok_or_else(|| {
            QueueError::InvalidItem(format!(
                "sample {} has an invalid location {:?}",
                self.sample_id, self.location
            ))
        })?;

        Ok(SampleData {
            sample_id: self.sample_id.clone(),
            name: self.sample_name.clone(),
            location,
            code: self.code.clone(),
            protein_acronym: self.protein_acronym.clone(),
            lims_id: self.lims_id,
        })
    }
}

/// A task as submitted by a client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskItem {
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(rename = "sampleID", default)]
    pub sample_id: Option<String>,
    #[serde(rename = "sampleQueueID", default)]
    pub sample_queue_id: Option<NodeId>,
    #[serde(rename = "queueID", default)]
    pub queue_id: Option<NodeId>,
    #[serde(default = "default_checked")]
    pub checked: bool,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub parameters: Value,
}

impl TaskItem {
    pub fn new(task_type: TaskType, parameters: Value) -> Self {
        Self {
            task_type,
            sample_id: None,
            sample_queue_id: None,
            queue_id: None,
            checked: true,
            label: None,
            name: None,
            parameters,
        }
    }

    pub fn data_collection(parameters: Value) -> Self {
        Self::new(TaskType::DataCollection, parameters)
    }

    pub fn for_sample(mut self, sample_id: impl Into<String>) -> Self {
        self.sample_id = Some(sample_id.into());
        self
    }

    pub fn unchecked(mut self) -> Self {
        self.checked = false;
        self
    }

    fn parse<T: for<'de> Deserialize<'de>>(&self) -> QueueResult<T> {
        let parameters = match &self.parameters {
            Value::Null => Value::Object(Map::new()),
            other => other.clone(),
        };

        serde_json::from_value(parameters).map_err(|e| {
            QueueError::InvalidItem(format!("{} parameters: {}", self.task_type, e))
        })
    }
}

/// Naming fields shared by every task kind that writes files
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct NamingParams {
    prefix: String,
    subdir: String,
    run_number: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct DataCollectionParams {
    #[serde(flatten)]
    naming: NamingParams,
    #[serde(flatten)]
    acquisition: AcquisitionParameters,
    helical: bool,
    mesh: bool,
    shape: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct CharacterisationParams {
    #[serde(flatten)]
    collection: DataCollectionParams,
    #[serde(flatten)]
    strategy: CharacterisationParameters,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct XrfParams {
    #[serde(flatten)]
    naming: NamingParams,
    count_time: f64,
    shape: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct EnergyScanParams {
    #[serde(flatten)]
    naming: NamingParams,
    element: String,
    edge: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct InterleavedParams {
    wedges: Vec<TaskItem>,
    sw_num_images: u32,
    task_index_list: Option<Vec<usize>>,
}

fn shape_string(shape: &Option<Value>) -> String {
    match shape {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Interleaved task request after parsing
#[derive(Debug, Clone)]
pub struct InterleavedRequest {
    pub sub_wedge_size: u32,
    pub wedges: Vec<TaskItem>,
    /// Client task indices of existing tasks whose data became the wedges
    pub absorbed: Option<Vec<usize>>,
}

impl InterleavedRequest {
    pub fn from_item(item: &TaskItem) -> QueueResult<Self> {
        let params: InterleavedParams = item.parse()?;

        if params.sw_num_images == 0 {
            return Err(QueueError::InvalidItem(
                "interleaved task needs a sub-wedge size".to_string(),
            ));
        }

        Ok(Self {
            sub_wedge_size: params.sw_num_images,
            wedges: params.wedges,
            absorbed: params.task_index_list,
        })
    }
}

/// Builds node payloads for one sample from client items.
///
/// Paths are resolved against the queue context and run numbers against
/// every template already in the tree.
pub struct ItemBuilder<'a> {
    context: &'a QueueContext,
    tree: &'a QueueTree,
    sample: &'a SampleData,
}

impl<'a> ItemBuilder<'a> {
    pub fn new(context: &'a QueueContext, tree: &'a QueueTree, sample: &'a SampleData) -> Self {
        Self {
            context,
            tree,
            sample,
        }
    }

    /// Build the payload of any non-interleaved task kind
    pub fn build(&self, item: &TaskItem) -> QueueResult<TaskPayload> {
        match item.task_type {
            TaskType::DataCollection => Ok(TaskPayload::DataCollection(self.data_collection(item)?)),
            TaskType::Characterisation => {
                Ok(TaskPayload::Characterisation(self.characterisation(item)?))
            }
            TaskType::Workflow => Ok(TaskPayload::Workflow(self.workflow(item)?)),
            TaskType::XrfScan => Ok(TaskPayload::XrfScan(self.xrf_scan(item)?)),
            TaskType::EnergyScan => Ok(TaskPayload::EnergyScan(self.energy_scan(item)?)),
            TaskType::SampleCentring => Ok(TaskPayload::SampleCentring(SampleCentringData {
                parameters: item.parameters.as_object().cloned().unwrap_or_default(),
            })),
            TaskType::Interleaved => Err(QueueError::InvalidItem(
                "interleaved tasks are built as task groups".to_string(),
            )),
        }
    }

    fn path_template(&self, naming: &NamingParams, suffix: &str) -> PathTemplate {
        let subdir = if naming.subdir.is_empty() {
            self.sample.default_subdir()
        } else {
            naming.subdir.clone()
        };

        PathTemplate {
            directory: self.context.image_directory(&subdir),
            process_directory: self.context.process_directory(&subdir),
            base_prefix: if naming.prefix.is_empty() {
                self.sample.default_prefix()
            } else {
                naming.prefix.clone()
            },
            suffix: suffix.to_string(),
            precision: self.context.file_precision,
            ..Default::default()
        }
    }

    /// Keep the submitted run number for items already in a queue, resolve a fresh one otherwise
    fn assign_run_number(&self, template: &mut PathTemplate, item: &TaskItem, naming: &NamingParams) {
        template.run_number = match (item.queue_id, naming.run_number) {
            (Some(_), Some(run)) => run,
            _ => self
                .context
                .run_numbers
                .next_run_number(template, self.tree.path_templates()),
        };
    }

    fn collection_from(
        &self,
        item: &TaskItem,
        params: &DataCollectionParams,
        reference_prefix: Option<&str>,
    ) -> DataCollectionData {
        let mut path_template = self.path_template(&params.naming, &self.context.detector_file_suffix);
        path_template.start_num = params.acquisition.first_image;
        path_template.num_files = params.acquisition.num_images;
        if let Some(prefix) = reference_prefix {
            path_template.reference_image_prefix = prefix.to_string();
        }
        self.assign_run_number(&mut path_template, item, &params.naming);

        let experiment_type = if params.helical {
            ExperimentType::Helical
        } else if params.mesh {
            ExperimentType::Mesh
        } else {
            ExperimentType::Native
        };

        DataCollectionData {
            path_template,
            acquisition: params.acquisition.clone(),
            experiment_type,
            shape: shape_string(&params.shape),
        }
    }

    pub fn data_collection(&self, item: &TaskItem) -> QueueResult<DataCollectionData> {
        let params: DataCollectionParams = item.parse()?;
        validate_acquisition(&params.acquisition)?;
        Ok(self.collection_from(item, &params, None))
    }

    /// Build one wedge of an interleaved group
    pub fn wedge(&self, item: &TaskItem, wedge_number: usize) -> QueueResult<DataCollectionData> {
        let params: DataCollectionParams = item.parse()?;
        validate_acquisition(&params.acquisition)?;

        let mut dc = self.collection_from(item, &params, None);
        dc.path_template.wedge_prefix = format!("wedge-{}", wedge_number);
        dc.acquisition.take_snapshots = false;
        // The wedge prefix opens a new file series
        self.assign_run_number(&mut dc.path_template, item, &params.naming);
        Ok(dc)
    }

    pub fn characterisation(&self, item: &TaskItem) -> QueueResult<CharacterisationData> {
        let params: CharacterisationParams = item.parse()?;
        validate_acquisition(&params.collection.acquisition)?;

        Ok(CharacterisationData {
            reference: self.collection_from(
                item,
                &params.collection,
                Some(env::REFERENCE_IMAGE_PREFIX),
            ),
            parameters: params.strategy,
            auto_add_diff_plan: self.context.auto_add_diffplan,
            diffraction_plan: Vec::new(),
        })
    }

    pub fn workflow(&self, item: &TaskItem) -> QueueResult<WorkflowData> {
        let naming: NamingParams = item.parse()?;
        let mut path_template = self.path_template(&naming, &self.context.detector_file_suffix);
        self.assign_run_number(&mut path_template, item, &naming);

        let mut parameters = item.parameters.as_object().cloned().unwrap_or_default();
        // Path fields are regenerated by the projection
        for key in path_template.to_parameters("").keys() {
            parameters.remove(key);
        }

        let label = item
            .label
            .clone()
            .or_else(|| parameters.get("label").and_then(Value::as_str).map(String::from))
            .unwrap_or_else(|| TaskType::Workflow.label().to_string());

        Ok(WorkflowData {
            label,
            name: item.name.clone().unwrap_or_default(),
            path_template,
            parameters,
        })
    }

    pub fn xrf_scan(&self, item: &TaskItem) -> QueueResult<XrfScanData> {
        let params: XrfParams = item.parse()?;
        if params.count_time < 0.0 {
            return Err(QueueError::InvalidItem(
                "XRF count time cannot be negative".to_string(),
            ));
        }

        let mut path_template = self.path_template(&params.naming, &self.context.xrf_file_suffix);
        self.assign_run_number(&mut path_template, item, &params.naming);

        Ok(XrfScanData {
            path_template,
            count_time: params.count_time,
            shape: shape_string(&params.shape),
        })
    }

    pub fn energy_scan(&self, item: &TaskItem) -> QueueResult<EnergyScanData> {
        let params: EnergyScanParams = item.parse()?;
        if params.element.is_empty() {
            return Err(QueueError::InvalidItem(
                "energy scan needs an element".to_string(),
            ));
        }

        let mut path_template =
            self.path_template(&params.naming, &self.context.energy_scan_file_suffix);
        self.assign_run_number(&mut path_template, item, &params.naming);

        Ok(EnergyScanData {
            path_template,
            element: params.element,
            edge: params.edge,
        })
    }

    /// Turn an absorbed data collection back into a wedge item
    pub fn wedge_item_from(&self, dc: &DataCollectionData) -> TaskItem {
        let mut parameters = match serde_json::to_value(&dc.acquisition) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        parameters.insert("prefix".into(), dc.path_template.base_prefix.clone().into());
        parameters.insert(
            "subdir".into(),
            dc.path_template
                .subdir(&self.context.raw_data_folder_name)
                .into(),
        );
        parameters.insert(
            "helical".into(),
            (dc.experiment_type == ExperimentType::Helical).into(),
        );
        parameters.insert(
            "mesh".into(),
            (dc.experiment_type == ExperimentType::Mesh).into(),
        );
        parameters.insert("shape".into(), dc.shape.clone().into());

        TaskItem::data_collection(Value::Object(parameters))
    }
}

/// Re-apply client parameters to an existing collection, keeping its run number
pub fn update_collection(
    builder: &ItemBuilder<'_>,
    existing: &DataCollectionData,
    item: &TaskItem,
) -> QueueResult<DataCollectionData> {
    let mut updated = builder.data_collection(item)?;
    updated.path_template.run_number = existing.path_template.run_number;
    updated.path_template.reference_image_prefix =
        existing.path_template.reference_image_prefix.clone();
    updated.path_template.wedge_prefix = existing.path_template.wedge_prefix.clone();
    Ok(updated)
}

fn validate_acquisition(acquisition: &AcquisitionParameters) -> QueueResult<()> {
    if acquisition.num_images == 0 {
        return Err(QueueError::InvalidItem(
            "a collection needs at least one image".to_string(),
        ));
    }
    if acquisition.exp_time < 0.0 || acquisition.osc_range < 0.0 {
        return Err(QueueError::InvalidItem(
            "exposure time and oscillation range cannot be negative".to_string(),
        ));
    }
    Ok(())
}
