use crate::env;
use crate::queue::path::RunNumberCache;
use crate::queue::types::NodeId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Queue configuration, loadable from TOML
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Run the whole queue on start instead of only the requested sample
    pub auto_mount_sample: bool,
    /// Promote diffraction plans into the queue as soon as they arrive
    pub auto_add_diffplan: bool,
    pub num_snapshots: u32,
    pub file_precision: usize,
    pub raw_data_folder_name: String,
    pub base_image_directory: String,
    pub base_process_directory: String,
    pub detector_file_suffix: String,
    pub xrf_file_suffix: String,
    pub energy_scan_file_suffix: String,
    /// Link shown with each task's LIMS data, `{id}` replaced by the node id
    pub lims_link_template: Option<String>,
    /// Proposal the queue is persisted under
    pub proposal_id: Option<u64>,
    pub store: StoreConfig,
    pub simulation: SimulationConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            auto_mount_sample: false,
            auto_add_diffplan: false,
            num_snapshots: 4,
            file_precision: env::DEFAULT_FILE_PRECISION,
            raw_data_folder_name: env::DEFAULT_RAW_DATA_FOLDER_NAME.to_string(),
            base_image_directory: format!("/data/{}", env::DEFAULT_RAW_DATA_FOLDER_NAME),
            base_process_directory: "/data/PROCESSED_DATA".to_string(),
            detector_file_suffix: env::DEFAULT_DETECTOR_SUFFIX.to_string(),
            xrf_file_suffix: env::DEFAULT_XRF_SUFFIX.to_string(),
            energy_scan_file_suffix: env::DEFAULT_ENERGY_SCAN_SUFFIX.to_string(),
            lims_link_template: None,
            proposal_id: None,
            store: StoreConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

/// Where persisted queue snapshots live
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct StoreConfig {
    /// Snapshot directory, `./.mxqueue/queues` when unset
    pub directory: Option<PathBuf>,
    pub compress: bool,
}

impl StoreConfig {
    pub fn resolve_directory(&self, workspace_root: &Path) -> PathBuf {
        self.directory
            .clone()
            .unwrap_or_else(|| env::default_queue_store_dir(workspace_root))
    }
}

/// Timing of the simulated device used by the command line runner
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimulationConfig {
    pub image_delay_ms: u64,
    pub mount_delay_ms: u64,
    pub task_delay_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            image_delay_ms: 10,
            mount_delay_ms: 50,
            task_delay_ms: 20,
        }
    }
}

impl QueueConfig {
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load from TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Save to TOML file
    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }
}

/// Runtime flags and caches shared by every queue operation.
///
/// Lives inside the queue state, behind the same lock as the tree.
#[derive(Debug, Clone)]
pub struct QueueContext {
    pub auto_mount_next: bool,
    pub auto_add_diffplan: bool,
    pub num_snapshots: u32,
    /// User group sub-folder inserted below the base directories
    pub group_folder: String,
    pub file_precision: usize,
    pub raw_data_folder_name: String,
    pub base_image_directory: String,
    pub base_process_directory: String,
    pub detector_file_suffix: String,
    pub xrf_file_suffix: String,
    pub energy_scan_file_suffix: String,
    pub lims_link_template: Option<String>,
    pub run_numbers: RunNumberCache,
}

impl Default for QueueContext {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

impl QueueContext {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            auto_mount_next: config.auto_mount_sample,
            auto_add_diffplan: config.auto_add_diffplan,
            num_snapshots: config.num_snapshots,
            group_folder: String::new(),
            file_precision: config.file_precision,
            raw_data_folder_name: config.raw_data_folder_name.clone(),
            base_image_directory: config.base_image_directory.clone(),
            base_process_directory: config.base_process_directory.clone(),
            detector_file_suffix: config.detector_file_suffix.clone(),
            xrf_file_suffix: config.xrf_file_suffix.clone(),
            energy_scan_file_suffix: config.energy_scan_file_suffix.clone(),
            lims_link_template: config.lims_link_template.clone(),
            run_numbers: RunNumberCache::new(),
        }
    }

    /// Image directory for a task sub-directory, group folder included
    pub fn image_directory(&self, subdir: &str) -> String {
        join_dirs(&self.base_image_directory, &self.group_folder, subdir)
    }

    pub fn process_directory(&self, subdir: &str) -> String {
        join_dirs(&self.base_process_directory, &self.group_folder, subdir)
    }

    pub fn lims_link(&self, node_id: NodeId) -> Option<String> {
        self.lims_link_template
            .as_ref()
            .map(|template| template.replace("{id}", &node_id.to_string()))
    }
}

fn join_dirs(base: &str, group: &str, subdir: &str) -> String {
    let mut path = PathBuf::from(base);
    for part in [group, subdir] {
        let part = part.trim_matches('/');
        if !part.is_empty() {
            path.push(part);
        }
    }
    path.to_string_lossy().into_owned()
}

/// Normalize a user group folder: no leading `/` or `.`, a trailing `/`,
/// and only `[a-zA-Z0-9_/-]` characters
pub fn sanitize_group_folder(path: &str) -> String {
    let mut path = path.to_string();

    if path.starts_with('/') || path.starts_with('.') {
        path.remove(0);
    }

    if !path.is_empty() && !path.ends_with('/') {
        path.push('/');
    }

    path.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '/' | '-'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_toml_roundtrip_with_partial_file() {
        let config = QueueConfig::from_toml_str(
            r#"
auto_mount_sample = true
file_precision = 5

[store]
compress = true
"#,
        )
        .unwrap();

        assert!(config.auto_mount_sample);
        assert_eq!(config.file_precision, 5);
        assert!(config.store.compress);
        assert_eq!(config.xrf_file_suffix, "dat");
        assert_eq!(config.energy_scan_file_suffix, "raw");

        let text = config.to_toml_string().unwrap();
        assert_eq!(QueueConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_directories_include_group_folder() {
        let mut context = QueueContext::default();
        context.base_image_directory = "/data/RAW_DATA".to_string();
        assert_eq!(context.image_directory("lyso/x1"), "/data/RAW_DATA/lyso/x1");

        context.group_folder = "teamA/".to_string();
        assert_eq!(
            context.image_directory("lyso/x1"),
            "/data/RAW_DATA/teamA/lyso/x1"
        );
    }

    #[test]
    fn test_sanitize_group_folder() {
        assert_eq!(sanitize_group_folder("/team a$b"), "teamab/");
        assert_eq!(sanitize_group_folder(".hidden/dir/"), "hidden/dir/");
        assert_eq!(sanitize_group_folder(""), "");
    }

    #[test]
    fn test_lims_link() {
        let mut context = QueueContext::default();
        assert_eq!(context.lims_link(3), None);
        context.lims_link_template = Some("https://lims/dc/{id}".to_string());
        assert_eq!(context.lims_link(3).as_deref(), Some("https://lims/dc/3"));
    }
}
