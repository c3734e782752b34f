//! Environment constants and path utilities for the queue scheduler.
//!
//! This module centralizes the hardcoded names used throughout the crate:
//! configuration locations, persisted-queue keys, and the default file
//! naming conventions of the detector and scan hardware.

use std::path::{Path, PathBuf};

/// Main application directory name (hidden directory like .git, .vscode)
pub const MXQUEUE_DIR_NAME: &str = ".mxqueue";

/// Configuration file name inside the application directory
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Configuration file name looked up directly in the working directory
pub const LOCAL_CONFIG_FILE_NAME: &str = "mxqueue.toml";

/// System-wide configuration directory (Unix-like systems)
pub const SYSTEM_CONFIG_DIR: &str = "/etc/mxqueue";

/// Directory holding persisted queue snapshots, relative to the app directory
pub const QUEUES_DIR_NAME: &str = "queues";

/// Key prefix under which queue snapshots are stored, one per proposal
pub const QUEUE_KEY_PREFIX: &str = "mxcube.queue";

/// Extension of an uncompressed persisted snapshot
pub const SNAPSHOT_EXTENSION: &str = "json";

/// Extension of a gzip-compressed persisted snapshot
pub const COMPRESSED_SNAPSHOT_EXTENSION: &str = "json.gz";

/// Default number of digits used for image numbers in file names
pub const DEFAULT_FILE_PRECISION: usize = 4;

/// Default suffix of detector images
pub const DEFAULT_DETECTOR_SUFFIX: &str = "cbf";

/// Default suffix of XRF spectrum files
pub const DEFAULT_XRF_SUFFIX: &str = "dat";

/// Default suffix of energy scan files
pub const DEFAULT_ENERGY_SCAN_SUFFIX: &str = "raw";

/// Folder name separating the session root from the user sub-directory
pub const DEFAULT_RAW_DATA_FOLDER_NAME: &str = "RAW_DATA";

/// Prefix used when a sample carries no naming metadata
pub const DEFAULT_LOCAL_PREFIX: &str = "local-user";

/// Prefix prepended to the reference images of a characterisation
pub const REFERENCE_IMAGE_PREFIX: &str = "ref";

/// Sentinel diffraction plan id reported while no plan exists
pub const NO_DIFFRACTION_PLAN_ID: i64 = -1;

/// Get the key under which the queue of a proposal is persisted
pub fn queue_key(proposal_id: u64) -> String {
    format!("{}:{}", QUEUE_KEY_PREFIX, proposal_id)
}

/// Get the local application directory path for a workspace
pub fn local_app_dir_path(workspace_root: &Path) -> PathBuf {
    workspace_root.join(MXQUEUE_DIR_NAME)
}

/// Get the local configuration file path (./.mxqueue/config.toml)
pub fn local_config_file_path(workspace_root: &Path) -> PathBuf {
    local_app_dir_path(workspace_root).join(CONFIG_FILE_NAME)
}

/// Get the user configuration directory path (~/.mxqueue)
pub fn user_config_dir_path(home_dir: &Path) -> PathBuf {
    home_dir.join(MXQUEUE_DIR_NAME)
}

/// Get the user configuration file path (~/.mxqueue/config.toml)
pub fn user_config_file_path(home_dir: &Path) -> PathBuf {
    user_config_dir_path(home_dir).join(CONFIG_FILE_NAME)
}

/// Get the system configuration file path (/etc/mxqueue/config.toml)
pub fn system_config_file_path() -> PathBuf {
    PathBuf::from(SYSTEM_CONFIG_DIR).join(CONFIG_FILE_NAME)
}

/// Get the default directory for persisted queue snapshots
pub fn default_queue_store_dir(workspace_root: &Path) -> PathBuf {
    local_app_dir_path(workspace_root).join(QUEUES_DIR_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_key_format() {
        assert_eq!(queue_key(42), "mxcube.queue:42");
    }

    #[test]
    fn test_config_paths() {
        let root = Path::new("/work");
        assert_eq!(
            local_config_file_path(root),
            PathBuf::from("/work/.mxqueue/config.toml")
        );
        assert_eq!(
            default_queue_store_dir(root),
            PathBuf::from("/work/.mxqueue/queues")
        );
        assert_eq!(
            system_config_file_path(),
            PathBuf::from("/etc/mxqueue/config.toml")
        );
    }
}
