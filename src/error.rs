use crate::device::DeviceError;
use crate::queue::{ExecState, NodeId};
use thiserror::Error;

/// Result alias used by every queue operation
pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// Errors raised by the queue tree, its control plane, and the execution engine.
///
/// Every control-plane mutation is all-or-nothing: when one of these is
/// returned, the tree has not been modified.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Node {0} not found")]
    NotFound(NodeId),

    #[error("Sample {0} is not in the queue")]
    SampleNotFound(String),

    #[error("Index {index} out of range for {len} children")]
    InvalidIndex { index: usize, len: usize },

    #[error("Nodes {first} and {second} do not share a parent")]
    CrossParentReorder { first: NodeId, second: NodeId },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid queue item: {0}")]
    InvalidItem(String),

    #[error("Execution engine is busy ({0})")]
    EngineBusy(ExecState),

    #[error("Execution engine failed, reset required")]
    EngineFailed,

    #[error("Hard failure while executing node {node_id}: {reason}")]
    HardFailure { node_id: NodeId, reason: String },

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
