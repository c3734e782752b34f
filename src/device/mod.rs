//! Contract between the execution engine and the beamline hardware.
//!
//! The engine mounts samples and executes leaf tasks through [`DeviceLayer`].
//! Progress flows back separately as [`DeviceEvent`]s published on an
//! [`EventBus`](crate::queue::EventBus). Those events only update counters
//! and never steer control flow.

pub mod simulated;

pub use simulated::{DeviceCall, SimulatedDevice, SimulatedDeviceConfig};

use crate::queue::{AcquisitionParameters, NodeId, SampleView, TaskView};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result of executing one leaf task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceOutcome {
    Success,
    /// Omit this task but keep the queue running
    Skip(String),
    /// Abort the whole run
    Failure(String),
}

impl DeviceOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DeviceOutcome::Success)
    }
}

/// Errors raised by the device layer outside of task execution
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeviceError {
    #[error("Failed to mount sample {sample_id}: {reason}")]
    MountFailed { sample_id: String, reason: String },

    #[error("Device unavailable: {0}")]
    Unavailable(String),
}

/// Asynchronous notifications emitted by the hardware while it works
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceEvent {
    OscillationStarted {
        node_id: NodeId,
    },
    ImageTaken {
        node_id: NodeId,
        image_number: u32,
    },
    OscillationFinished {
        node_id: NodeId,
    },
    CollectionEnded {
        node_id: NodeId,
    },
    /// Data analysis proposed collections for a characterisation
    DiffractionPlanAvailable {
        characterisation_id: NodeId,
        collections: Vec<AcquisitionParameters>,
    },
}

impl DeviceEvent {
    pub fn node_id(&self) -> NodeId {
        match self {
            DeviceEvent::OscillationStarted { node_id }
            | DeviceEvent::ImageTaken { node_id, .. }
            | DeviceEvent::OscillationFinished { node_id }
            | DeviceEvent::CollectionEnded { node_id } => *node_id,
            DeviceEvent::DiffractionPlanAvailable {
                characterisation_id,
                ..
            } => *characterisation_id,
        }
    }
}

/// Hardware operations the execution engine depends on.
///
/// Implementations must tolerate [`DeviceLayer::interrupt`] arriving at any
/// time; an interrupted `execute` should return promptly.
#[async_trait]
pub trait DeviceLayer: Send + Sync {
    /// Mount a sample so its tasks can run
    async fn mount(&self, sample: &SampleView) -> Result<(), DeviceError>;

    /// Execute one leaf task and report how it went
    async fn execute(&self, task: &TaskView) -> DeviceOutcome;

    /// Ask the in-flight `execute` call to stop early
    async fn interrupt(&self);
}
