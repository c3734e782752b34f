//! Simulated beamline for running queues without hardware.
//!
//! Collections "take" images at a configurable rate and publish the same
//! events real detectors would. Outcomes, mount failures and diffraction
//! plans can be scripted per node, and an optional gate holds every
//! execution until it is released so callers can act mid-task.

use crate::device::{DeviceError, DeviceEvent, DeviceLayer, DeviceOutcome};
use crate::queue::{AcquisitionParameters, EventBus, NodeId, SampleView, TaskType, TaskView};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore, watch};
use tracing::{debug, info, warn};

/// Timing of the simulated hardware
#[derive(Debug, Clone)]
pub struct SimulatedDeviceConfig {
    pub image_delay: Duration,
    pub mount_delay: Duration,
    /// Time spent by tasks that do not take images
    pub task_delay: Duration,
}

impl Default for SimulatedDeviceConfig {
    fn default() -> Self {
        Self {
            image_delay: Duration::from_millis(5),
            mount_delay: Duration::from_millis(5),
            task_delay: Duration::from_millis(5),
        }
    }
}

/// A call received by the simulated device, recorded in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    Mount(String),
    Execute(NodeId),
    Interrupt,
}

pub struct SimulatedDevice {
    config: SimulatedDeviceConfig,
    bus: EventBus<DeviceEvent>,
    outcomes: Mutex<HashMap<NodeId, DeviceOutcome>>,
    mount_failures: Mutex<HashSet<String>>,
    diffraction_plans: Mutex<HashMap<NodeId, Vec<AcquisitionParameters>>>,
    calls: Mutex<Vec<DeviceCall>>,
    gate: Option<Arc<Semaphore>>,
    executing: watch::Sender<Option<NodeId>>,
    interrupted: AtomicBool,
    interrupt_notify: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SimulatedDevice {
    pub fn new(bus: EventBus<DeviceEvent>) -> Self {
        Self::with_config(bus, SimulatedDeviceConfig::default())
    }

    pub fn with_config(bus: EventBus<DeviceEvent>, config: SimulatedDeviceConfig) -> Self {
        let (executing, _) = watch::channel(None);
        Self {
            config,
            bus,
            outcomes: Mutex::new(HashMap::new()),
            mount_failures: Mutex::new(HashSet::new()),
            diffraction_plans: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            gate: None,
            executing,
            interrupted: AtomicBool::new(false),
            interrupt_notify: Notify::new(),
        }
    }

    /// Hold every execution until [`SimulatedDevice::release`] lets it through
    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    /// Let `count` held executions proceed
    pub fn release(&self, count: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(count);
        }
    }

    /// Script the outcome of a node, success otherwise
    pub fn set_outcome(&self, node_id: NodeId, outcome: DeviceOutcome) {
        lock(&self.outcomes).insert(node_id, outcome);
    }

    pub fn fail_mount(&self, sample_id: impl Into<String>) {
        lock(&self.mount_failures).insert(sample_id.into());
    }

    /// Publish a diffraction plan once the given characterisation completes
    pub fn set_diffraction_plan(&self, characterisation_id: NodeId, plan: Vec<AcquisitionParameters>) {
        lock(&self.diffraction_plans).insert(characterisation_id, plan);
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        lock(&self.calls).clone()
    }

    /// Node ids passed to `execute`, in call order
    pub fn executed_nodes(&self) -> Vec<NodeId> {
        lock(&self.calls)
            .iter()
            .filter_map(|call| match call {
                DeviceCall::Execute(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    /// Wait until `execute` is in flight for the given node
    pub async fn wait_until_executing(&self, node_id: NodeId) {
        let mut rx = self.executing.subscribe();
        // The sender lives as long as self, so this only ends on a match
        let _ = rx.wait_for(|current| *current == Some(node_id)).await;
    }

    fn record(&self, call: DeviceCall) {
        lock(&self.calls).push(call);
    }

    fn image_count(task: &TaskView) -> u32 {
        match task.task_type {
            TaskType::DataCollection | TaskType::Characterisation => task.num_images().unwrap_or(1),
            _ => 0,
        }
    }

    async fn run_task(&self, task: &TaskView) {
        let node_id = task.queue_id;
        let images = Self::image_count(task);

        if let Some(gate) = &self.gate
            && let Ok(permit) = gate.acquire().await
        {
            permit.forget();
        }

        if images == 0 {
            tokio::time::sleep(self.config.task_delay).await;
            return;
        }

        self.bus.publish(DeviceEvent::OscillationStarted { node_id });
        for image_number in 1..=images {
            tokio::time::sleep(self.config.image_delay).await;
            self.bus.publish(DeviceEvent::ImageTaken {
                node_id,
                image_number,
            });
        }
        self.bus.publish(DeviceEvent::OscillationFinished { node_id });
    }
}

#[async_trait]
impl DeviceLayer for SimulatedDevice {
    async fn mount(&self, sample: &SampleView) -> Result<(), DeviceError> {
        self.record(DeviceCall::Mount(sample.sample_id.clone()));
        tokio::time::sleep(self.config.mount_delay).await;

        if lock(&self.mount_failures).contains(&sample.sample_id) {
            warn!("Simulated mount failure for sample {}", sample.sample_id);
            return Err(DeviceError::MountFailed {
                sample_id: sample.sample_id.clone(),
                reason: "sample not found in changer".to_string(),
            });
        }

        info!("Mounted sample {}", sample.sample_id);
        Ok(())
    }

    async fn execute(&self, task: &TaskView) -> DeviceOutcome {
        let node_id = task.queue_id;
        self.record(DeviceCall::Execute(node_id));
        debug!("Executing {} node {}", task.task_type, node_id);

        let notified = self.interrupt_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        self.executing.send_replace(Some(node_id));

        let interrupted = if self.interrupted.swap(false, Ordering::SeqCst) {
            true
        } else {
            tokio::select! {
                _ = &mut notified => true,
                _ = self.run_task(task) => false,
            }
        };

        self.executing.send_replace(None);
        self.interrupted.store(false, Ordering::SeqCst);

        if interrupted {
            info!("Execution of node {} interrupted", node_id);
            return DeviceOutcome::Failure("interrupted".to_string());
        }

        self.bus.publish(DeviceEvent::CollectionEnded { node_id });

        let plan = lock(&self.diffraction_plans).remove(&node_id);
        if let Some(collections) = plan {
            self.bus.publish(DeviceEvent::DiffractionPlanAvailable {
                characterisation_id: node_id,
                collections,
            });
        }

        lock(&self.outcomes)
            .get(&node_id)
            .cloned()
            .unwrap_or(DeviceOutcome::Success)
    }

    async fn interrupt(&self) {
        self.record(DeviceCall::Interrupt);
        if self.executing.borrow().is_some() {
            self.interrupted.store(true, Ordering::SeqCst);
            self.interrupt_notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dc_view(node_id: NodeId, images: u32) -> TaskView {
        TaskView {
            label: "Data Collection".to_string(),
            task_type: TaskType::DataCollection,
            name: None,
            parameters: json!({ "num_images": images }),
            sample_id: "1:01".to_string(),
            sample_queue_id: 1,
            task_index: Some(0),
            queue_id: node_id,
            checked: true,
            state: crate::queue::NodeState::Uncollected,
            progress: 0.0,
            lims_result_data: None,
            diffraction_plan: None,
            diffraction_plan_id: None,
            is_diffraction_plan: None,
        }
    }

    #[tokio::test]
    async fn test_execute_publishes_image_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let device = SimulatedDevice::new(bus);

        let outcome = device.execute(&dc_view(7, 3)).await;
        assert_eq!(outcome, DeviceOutcome::Success);

        let mut images = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let DeviceEvent::ImageTaken { image_number, .. } = event {
                images.push(image_number);
            }
        }
        assert_eq!(images, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_scripted_outcome_and_mount_failure() {
        let device = SimulatedDevice::new(EventBus::new());
        device.set_outcome(3, DeviceOutcome::Skip("bad crystal".to_string()));
        assert_eq!(
            device.execute(&dc_view(3, 1)).await,
            DeviceOutcome::Skip("bad crystal".to_string())
        );

        device.fail_mount("1:01");
        let sample = SampleView {
            sample_id: "1:01".to_string(),
            queue_id: 1,
            code: String::new(),
            location: "1:01".to_string(),
            sample_name: "x1".to_string(),
            protein_acronym: String::new(),
            lims_id: None,
            default_prefix: "x1".to_string(),
            default_sub_dir: "x1".to_string(),
            view_type: "Sample".to_string(),
            checked: true,
            state: crate::queue::NodeState::Uncollected,
            tasks: Vec::new(),
        };
        assert!(device.mount(&sample).await.is_err());
        assert_eq!(
            device.calls(),
            vec![DeviceCall::Execute(3), DeviceCall::Mount("1:01".to_string())]
        );
    }

    #[tokio::test]
    async fn test_interrupt_releases_gated_execution() {
        let device = Arc::new(SimulatedDevice::new(EventBus::new()).gated());
        let running = {
            let device = device.clone();
            tokio::spawn(async move { device.execute(&dc_view(5, 10)).await })
        };

        device.wait_until_executing(5).await;
        device.interrupt().await;

        let outcome = running.await.unwrap();
        assert_eq!(outcome, DeviceOutcome::Failure("interrupted".to_string()));
        assert_eq!(
            device.calls(),
            vec![DeviceCall::Execute(5), DeviceCall::Interrupt]
        );
    }
}
