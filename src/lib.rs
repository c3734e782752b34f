//! # mxqueue
//!
//! Experiment queue scheduler for macromolecular crystallography beamlines.
//! Users queue samples and the experiments to run on them; the queue is kept
//! as a tree, projected into the flat JSON view clients display, and executed
//! sequentially against the beamline hardware with pause, stop and skip
//! semantics.
//!
//! ## Architecture Overview
//!
//! - **[`queue`]**: The queue tree, enable cascade, reordering, client
//!   projection, execution engine, persistence and the [`QueueManager`]
//!   control plane that ties them together
//! - **[`device`]**: The hardware contract the engine drives, with a
//!   simulated beamline for tests and dry runs
//! - **[`cli`]**: Argument parsing and configuration discovery for the
//!   `mxqueue` binary
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mxqueue::{QueueConfig, QueueManager, SampleItem, TaskItem};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (manager, _device) = QueueManager::with_simulated_device(&QueueConfig::default());
//!
//!     let sample = SampleItem::new("1:01", "lysozyme")
//!         .with_task(TaskItem::data_collection(json!({ "num_images": 100 })));
//!     manager.add_items(vec![sample]).await?;
//!
//!     manager.start(None).await?;
//!     let summary = manager.wait().await?;
//!     println!("{} tasks collected", summary.succeeded);
//!     Ok(())
//! }
//! ```

/// Queue model, projection and execution.
pub mod queue;

/// Beamline hardware contract and the simulated device.
pub mod device;

/// Error types shared by the queue and its control plane.
pub mod error;

/// Environment constants and path utilities.
///
/// Centralizes hardcoded paths, file names and queue defaults.
pub mod env;

// CLI module for command-line interface
pub mod cli;

pub use device::{DeviceError, DeviceEvent, DeviceLayer, DeviceOutcome, SimulatedDevice};
pub use error::{QueueError, QueueResult};
pub use queue::{
    EventBus, ExecState, FileQueueStore, MemoryQueueStore, NodeId, QueueConfig, QueueEvent,
    QueueManager, QueueSnapshot, QueueStore, RunSummary, SampleItem, SampleView, TaskItem,
    TaskView,
};
