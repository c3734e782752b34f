//! CLI-specific functionality for mxqueue
//!
//! This module contains argument parsing and configuration discovery.

pub mod args;
pub mod config;

pub use args::{Args, ExecutionMode, InitConfigOptions, RunConfig, ShowSnapshotConfig};
pub use config::ConfigDiscovery;
