use crate::env;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Naming template describing where a task writes its files
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct PathTemplate {
    pub directory: String,
    pub process_directory: String,
    pub base_prefix: String,
    pub reference_image_prefix: String,
    pub wedge_prefix: String,
    pub run_number: u32,
    pub start_num: u32,
    pub num_files: u32,
    pub suffix: String,
    pub precision: usize,
}

impl Default for PathTemplate {
    fn default() -> Self {
        Self {
            directory: String::new(),
            process_directory: String::new(),
            base_prefix: String::new(),
            reference_image_prefix: String::new(),
            wedge_prefix: String::new(),
            run_number: 1,
            start_num: 1,
            num_files: 1,
            suffix: env::DEFAULT_DETECTOR_SUFFIX.to_string(),
            precision: env::DEFAULT_FILE_PRECISION,
        }
    }
}

/// Components recovered from a concrete image path
#[derive(Debug, Clone, PartialEq)]
pub struct InterpretedPath {
    /// Directory joined with the file prefix
    pub prefix_path: String,
    pub run_number: u32,
    pub image_number: u32,
}

fn image_path_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<prefix_path>.+)_(?P<run>\d+)_(?P<image>\d+)\.[^./]+$").ok()
    })
    .as_ref()
}

impl PathTemplate {
    /// Full prefix including the reference and wedge decorations
    pub fn prefix(&self) -> String {
        let mut prefix = self.base_prefix.clone();

        if !self.reference_image_prefix.is_empty() {
            prefix = format!("{}-{}", self.reference_image_prefix, prefix);
        }

        if !self.wedge_prefix.is_empty() {
            prefix = format!("{}_{}", prefix, self.wedge_prefix);
        }

        prefix
    }

    /// Image file name with a printf-style image number placeholder
    pub fn image_file_name(&self) -> String {
        format!(
            "{}_{}_%0{}d.{}",
            self.prefix(),
            self.run_number,
            self.precision,
            self.suffix
        )
    }

    /// Client-facing file name, the image number placeholder shown as `#` characters
    pub fn display_file_name(&self) -> String {
        self.image_file_name().replace(
            &format!("%0{}d", self.precision),
            &"#".repeat(self.precision),
        )
    }

    /// Path of the first image this template will write
    pub fn first_image_path(&self) -> String {
        let name = format!(
            "{}_{}_{:0width$}.{}",
            self.prefix(),
            self.run_number,
            self.start_num,
            self.suffix,
            width = self.precision
        );
        join_path(&self.directory, &name)
    }

    pub fn full_path(&self) -> String {
        join_path(&self.directory, &self.display_file_name())
    }

    /// Directory joined with the prefix, the key used for run number lookups
    pub fn prefix_path(&self) -> String {
        join_path(&self.directory, &self.prefix())
    }

    /// Portion of the directory below the raw data folder
    pub fn subdir(&self, raw_data_folder_name: &str) -> String {
        if raw_data_folder_name.is_empty() {
            return String::new();
        }

        self.directory
            .split_once(raw_data_folder_name)
            .map(|(_, rest)| rest.trim_matches('/').to_string())
            .unwrap_or_default()
    }

    /// Whether two templates would write into the same file series
    pub fn shares_prefix_with(&self, other: &PathTemplate) -> bool {
        self.directory == other.directory && self.prefix() == other.prefix()
    }

    /// Split a concrete image path into prefix path, run number and image number
    pub fn interpret_path(path: &str) -> Option<InterpretedPath> {
        let captures = image_path_regex()?.captures(path)?;

        Some(InterpretedPath {
            prefix_path: captures["prefix_path"].to_string(),
            run_number: captures["run"].parse().ok()?,
            image_number: captures["image"].parse().ok()?,
        })
    }

    /// Path-derived fields merged into a projected task's parameters
    pub fn to_parameters(
        &self,
        raw_data_folder_name: &str,
    ) -> serde_json::Map<String, serde_json::Value> {
        let mut map = match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };

        map.insert("path".into(), self.directory.clone().into());
        map.insert("prefix".into(), self.base_prefix.clone().into());
        map.insert("subdir".into(), self.subdir(raw_data_folder_name).into());
        map.insert("fileName".into(), self.display_file_name().into());
        map.insert("fullPath".into(), self.full_path().into());
        map
    }
}

fn join_path(directory: &str, name: &str) -> String {
    Path::new(directory).join(name).to_string_lossy().into_owned()
}

/// Run numbers already present on disk, keyed by prefix path.
///
/// Built once from an externally supplied file listing so that newly queued
/// tasks do not reuse a run number whose images already exist.
#[derive(Debug, Clone, Default)]
pub struct RunNumberCache {
    runs: HashMap<String, u32>,
}

impl RunNumberCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the cache from a listing of image paths
    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut cache = Self::new();

        for path in paths {
            let path = path.as_ref();
            match PathTemplate::interpret_path(path) {
                Some(interpreted) => cache.record(&interpreted.prefix_path, interpreted.run_number),
                None => {
                    warn!("Failed to interpret path {:?}, ignoring it", path);
                }
            }
        }

        debug!("Run number cache holds {} prefix paths", cache.len());
        cache
    }

    /// Record a run, keeping the highest run number seen for the prefix path
    pub fn record(&mut self, prefix_path: &str, run_number: u32) {
        let entry = self.runs.entry(prefix_path.to_string()).or_insert(0);
        *entry = (*entry).max(run_number);
    }

    pub fn get(&self, prefix_path: &str) -> Option<u32> {
        self.runs.get(prefix_path).copied()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Resolve the run number for a new task.
    ///
    /// `queued` yields the templates already in the queue. The result is one
    /// past the highest queued run for the same directory and prefix, offset
    /// by any run found on disk for that prefix path.
    pub fn next_run_number<'a, I>(&self, template: &PathTemplate, queued: I) -> u32
    where
        I: IntoIterator<Item = &'a PathTemplate>,
    {
        let highest_queued = queued
            .into_iter()
            .filter(|other| other.shares_prefix_with(template))
            .map(|other| other.run_number)
            .max()
            .unwrap_or(0);

        let next = highest_queued + 1;

        match self.get(&template.prefix_path()) {
            Some(on_disk) => next + on_disk,
            None => next,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> PathTemplate {
        PathTemplate {
            directory: "/data/visitor/mx1234/RAW_DATA/lyso/lyso-x1".to_string(),
            base_prefix: "lyso-x1".to_string(),
            run_number: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_prefix_decorations() {
        let mut pt = template();
        assert_eq!(pt.prefix(), "lyso-x1");

        pt.reference_image_prefix = "ref".to_string();
        pt.wedge_prefix = "wedge-2".to_string();
        assert_eq!(pt.prefix(), "ref-lyso-x1_wedge-2");
    }

    #[test]
    fn test_file_names() {
        let pt = template();
        assert_eq!(pt.image_file_name(), "lyso-x1_2_%04d.cbf");
        assert_eq!(pt.display_file_name(), "lyso-x1_2_####.cbf");
        assert_eq!(
            pt.full_path(),
            "/data/visitor/mx1234/RAW_DATA/lyso/lyso-x1/lyso-x1_2_####.cbf"
        );
        assert_eq!(
            pt.first_image_path(),
            "/data/visitor/mx1234/RAW_DATA/lyso/lyso-x1/lyso-x1_2_0001.cbf"
        );
    }

    #[test]
    fn test_subdir() {
        let pt = template();
        assert_eq!(pt.subdir("RAW_DATA"), "lyso/lyso-x1");
        assert_eq!(pt.subdir("PROCESSED"), "");
    }

    #[test]
    fn test_interpret_path() {
        let parsed = PathTemplate::interpret_path("/data/RAW_DATA/abc_3_0007.cbf").unwrap();
        assert_eq!(parsed.prefix_path, "/data/RAW_DATA/abc");
        assert_eq!(parsed.run_number, 3);
        assert_eq!(parsed.image_number, 7);

        assert!(PathTemplate::interpret_path("/data/notes.txt").is_none());
    }

    #[test]
    fn test_next_run_number_uses_queue_and_disk() {
        let pt = template();
        let mut queued = pt.clone();
        queued.run_number = 3;
        let mut other_prefix = pt.clone();
        other_prefix.base_prefix = "other".to_string();
        other_prefix.run_number = 9;

        let empty = RunNumberCache::new();
        assert_eq!(empty.next_run_number(&pt, [&queued, &other_prefix]), 4);
        assert_eq!(empty.next_run_number(&pt, std::iter::empty()), 1);

        let cache = RunNumberCache::from_paths([
            "/data/visitor/mx1234/RAW_DATA/lyso/lyso-x1/lyso-x1_5_0001.cbf",
            "/data/visitor/mx1234/RAW_DATA/lyso/lyso-x1/lyso-x1_2_0001.cbf",
            "garbage",
        ]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.next_run_number(&pt, [&queued]), 4 + 5);
    }
}
