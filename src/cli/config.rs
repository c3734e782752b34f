//! Configuration discovery and loading
//!
//! This module handles the configuration discovery hierarchy:
//! 1. Current directory: ./mxqueue.toml or ./.mxqueue/config.toml
//! 2. User config: ~/.mxqueue/config.toml
//! 3. System config: /etc/mxqueue/config.toml
//! 4. Built-in defaults

use crate::env;
use crate::queue::QueueConfig;
use anyhow::{Context, Result};
use std::env as std_env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Configuration discovery system
pub struct ConfigDiscovery;

impl ConfigDiscovery {
    /// Load an explicit config file, or discover one through the hierarchy
    pub fn load(config_override: Option<&Path>) -> Result<QueueConfig> {
        match config_override {
            Some(path) => {
                info!("Loading configuration from: {:?}", path);
                QueueConfig::from_toml_file(path)
                    .with_context(|| format!("Failed to load configuration from {:?}", path))
            }
            None => Self::discover_config(),
        }
    }

    /// Discover and load configuration using the hierarchy
    pub fn discover_config() -> Result<QueueConfig> {
        if let Some(config_path) = Self::find_config_file() {
            info!("Loading configuration from: {:?}", config_path);
            return QueueConfig::from_toml_file(&config_path)
                .with_context(|| format!("Failed to load configuration from {:?}", config_path));
        }

        info!("No configuration file found, using defaults");
        Ok(QueueConfig::default())
    }

    /// Find configuration file using discovery hierarchy
    pub fn find_config_file() -> Option<PathBuf> {
        for candidate in Self::get_config_candidates() {
            debug!("Checking for config file: {:?}", candidate);
            if candidate.is_file() {
                debug!("Found config file: {:?}", candidate);
                return Some(candidate);
            }
        }

        debug!("No config file found in discovery hierarchy");
        None
    }

    /// Get list of configuration file candidates in priority order
    fn get_config_candidates() -> Vec<PathBuf> {
        let mut candidates = Vec::new();

        if let Ok(current_dir) = std_env::current_dir() {
            candidates.push(current_dir.join(env::LOCAL_CONFIG_FILE_NAME));
            candidates.push(env::local_config_file_path(&current_dir));
        }

        if let Some(home_dir) = Self::get_home_dir() {
            candidates.push(env::user_config_file_path(&home_dir));
        }

        #[cfg(unix)]
        candidates.push(env::system_config_file_path());

        candidates
    }

    /// Get home directory path
    fn get_home_dir() -> Option<PathBuf> {
        std_env::var("HOME")
            .ok()
            .or_else(|| std_env::var("USERPROFILE").ok())
            .map(PathBuf::from)
    }

    /// Create a default config file in the user's home directory
    pub fn create_default_user_config(force: bool) -> Result<PathBuf> {
        let home_dir = Self::get_home_dir().context("Could not determine home directory")?;
        let config_path = env::user_config_file_path(&home_dir);

        Self::write_default_config(&config_path, force)?;
        Ok(config_path)
    }

    /// Write the built-in defaults to `path`, keeping an existing file unless
    /// `force` is set. Returns whether the file was written.
    pub fn write_default_config(path: &Path, force: bool) -> Result<bool> {
        if path.exists() && !force {
            warn!("Configuration file already exists: {:?}", path);
            return Ok(false);
        }

        if let Some(config_dir) = path.parent()
            && !config_dir.as_os_str().is_empty()
            && !config_dir.exists()
        {
            fs::create_dir_all(config_dir)
                .with_context(|| format!("Failed to create {:?}", config_dir))?;
            info!("Created configuration directory: {:?}", config_dir);
        }

        QueueConfig::default()
            .to_toml_file(path)
            .with_context(|| format!("Failed to write configuration to {:?}", path))?;
        info!("Created default configuration file: {:?}", path);
        Ok(true)
    }

    /// Show configuration discovery information for debugging
    pub fn show_discovery_info() {
        println!("Configuration Discovery Hierarchy:");
        println!();

        for (i, candidate) in Self::get_config_candidates().iter().enumerate() {
            let status = if candidate.exists() {
                if candidate.is_file() {
                    "✓ EXISTS"
                } else {
                    "✗ NOT A FILE"
                }
            } else {
                "✗ NOT FOUND"
            };

            println!("  {}. {:?} - {}", i + 1, candidate, status);
        }

        println!();
        if let Some(found) = Self::find_config_file() {
            println!("Active configuration: {:?}", found);
        } else {
            println!("Active configuration: Built-in defaults");
        }
    }
}
