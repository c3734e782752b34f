use async_trait::async_trait;
use mxqueue::queue::{ExecState, NodeState, QueueConfig, SimulationConfig};
use mxqueue::{
    DeviceError, DeviceEvent, DeviceLayer, DeviceOutcome, EventBus, NodeId, QueueEvent,
    QueueManager, SampleItem, SampleView, TaskItem, TaskView,
};
use serde_json::json;
use std::sync::Mutex;

/// Beamline that records what it was asked to do and reports one image
/// per collection
struct RecordingBeamline {
    bus: EventBus<DeviceEvent>,
    mounted: Mutex<Vec<String>>,
    executed: Mutex<Vec<(String, NodeId)>>,
}

impl RecordingBeamline {
    fn new(bus: EventBus<DeviceEvent>) -> Self {
        Self {
            bus,
            mounted: Mutex::new(Vec::new()),
            executed: Mutex::new(Vec::new()),
        }
    }

    fn mounted(&self) -> Vec<String> {
        self.mounted.lock().unwrap().clone()
    }

    fn executed(&self) -> Vec<(String, NodeId)> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeviceLayer for RecordingBeamline {
    async fn mount(&self, sample: &SampleView) -> Result<(), DeviceError> {
        self.mounted.lock().unwrap().push(sample.sample_id.clone());
        Ok(())
    }

    async fn execute(&self, task: &TaskView) -> DeviceOutcome {
        self.executed
            .lock()
            .unwrap()
            .push((task.sample_id.clone(), task.queue_id));
        self.bus.publish(DeviceEvent::ImageTaken {
            node_id: task.queue_id,
            image_number: 1,
        });
        DeviceOutcome::Success
    }

    async fn interrupt(&self) {}
}

fn config(auto_mount: bool) -> QueueConfig {
    QueueConfig {
        auto_mount_sample: auto_mount,
        simulation: SimulationConfig {
            image_delay_ms: 1,
            mount_delay_ms: 1,
            task_delay_ms: 1,
        },
        ..QueueConfig::default()
    }
}

fn collection() -> TaskItem {
    TaskItem::data_collection(json!({ "num_images": 1, "exp_time": 0.01 }))
}

fn sample(sample_id: &str, tasks: usize) -> SampleItem {
    let mut item = SampleItem::new(sample_id, format!("crystal-{}", sample_id));
    for _ in 0..tasks {
        item = item.with_task(collection());
    }
    item
}

async fn task_ids(manager: &QueueManager, sample_id: &str) -> Vec<NodeId> {
    manager
        .get_sample(sample_id)
        .await
        .expect("Sample should exist")
        .tasks
        .iter()
        .map(|task| task.queue_id)
        .collect()
}

#[tokio::test]
async fn test_auto_mount_follows_sample_order() {
    let (manager, beamline) = QueueManager::with_device(&config(true), RecordingBeamline::new);
    manager
        .add_items(vec![sample("1:01", 2), sample("1:02", 1), sample("1:03", 1)])
        .await
        .expect("Should add samples");

    manager
        .set_sample_order(vec![
            "1:03".to_string(),
            "1:01".to_string(),
            "1:02".to_string(),
        ])
        .await
        .expect("Should reorder samples");

    manager.start(None).await.expect("Should start");
    let summary = manager.wait().await.expect("Run should complete");

    assert_eq!(summary.succeeded, 4);
    assert_eq!(summary.final_state, ExecState::Idle);
    assert_eq!(beamline.mounted(), vec!["1:03", "1:01", "1:02"]);

    let sample_order: Vec<String> = beamline
        .executed()
        .into_iter()
        .map(|(sample_id, _)| sample_id)
        .collect();
    assert_eq!(sample_order, vec!["1:03", "1:01", "1:01", "1:02"]);

    let snapshot = manager.snapshot().await.expect("Should project queue");
    for sample_id in &snapshot.sample_order {
        let view = &snapshot.samples[sample_id];
        assert_eq!(view.state, NodeState::Collected);
        assert!(view.tasks.iter().all(|task| task.progress == 1.0));
    }
}

#[tokio::test]
async fn test_sample_cascade_restores_task_flags() {
    let (manager, _) = QueueManager::with_device(&config(false), RecordingBeamline::new);
    manager
        .add_items(vec![sample("1:01", 3)])
        .await
        .expect("Should add sample");
    let sample_id = manager
        .get_sample("1:01")
        .await
        .expect("Sample should exist")
        .queue_id;
    let ids = task_ids(&manager, "1:01").await;

    manager.set_enabled(ids[1], false).await.expect("Should disable task");
    manager
        .set_enabled(sample_id, false)
        .await
        .expect("Should disable sample");

    let disabled = manager.get_sample("1:01").await.expect("Sample should exist");
    assert!(!disabled.checked);
    assert!(disabled.tasks.iter().all(|task| !task.checked));

    manager
        .set_enabled(sample_id, true)
        .await
        .expect("Should enable sample");
    let restored = manager.get_sample("1:01").await.expect("Sample should exist");
    let checked: Vec<bool> = restored.tasks.iter().map(|task| task.checked).collect();
    assert_eq!(checked, vec![true, false, true]);
}

#[tokio::test]
async fn test_sample_cascade_enables_all_after_a_structural_change() {
    let (manager, _) = QueueManager::with_device(&config(false), RecordingBeamline::new);
    manager
        .add_items(vec![sample("1:01", 3)])
        .await
        .expect("Should add sample");
    let sample_id = manager
        .get_sample("1:01")
        .await
        .expect("Sample should exist")
        .queue_id;
    let ids = task_ids(&manager, "1:01").await;

    manager.set_enabled(ids[1], false).await.expect("Should disable task");
    manager
        .set_enabled(sample_id, false)
        .await
        .expect("Should disable sample");
    manager.move_task("1:01", 0, 2).await.expect("Should move task");
    manager
        .set_enabled(sample_id, true)
        .await
        .expect("Should enable sample");

    let sample = manager.get_sample("1:01").await.expect("Sample should exist");
    assert!(sample.tasks.iter().all(|task| task.checked));
    assert_eq!(task_ids(&manager, "1:01").await, vec![ids[1], ids[2], ids[0]]);
}

#[tokio::test]
async fn test_projection_matches_tree_after_mixed_edits() {
    let (manager, _) = QueueManager::with_device(&config(false), RecordingBeamline::new);
    manager
        .add_items(vec![sample("1:01", 4), sample("1:02", 1)])
        .await
        .expect("Should add samples");
    let ids = task_ids(&manager, "1:01").await;

    manager.swap_task("1:01", 0, 3).await.expect("Should swap");
    manager.delete_node(ids[2]).await.expect("Should delete");
    manager
        .add_task("1:02", collection())
        .await
        .expect("Should add task");

    let snapshot = manager.snapshot().await.expect("Should project queue");
    assert_eq!(snapshot.task_count(), 5);
    assert_eq!(task_ids(&manager, "1:01").await, vec![ids[3], ids[1], ids[0]]);

    for sample_id in &snapshot.sample_order {
        let view = &snapshot.samples[sample_id];
        for (index, task) in view.tasks.iter().enumerate() {
            assert_eq!(task.sample_id, *sample_id);
            assert_eq!(task.sample_queue_id, view.queue_id);
            assert_eq!(task.task_index, Some(index));
            assert_eq!(task.state, NodeState::Uncollected);
        }
    }
}

#[tokio::test]
async fn test_run_emits_lifecycle_events() {
    let (manager, _) = QueueManager::with_device(&config(false), RecordingBeamline::new);
    manager
        .add_items(vec![sample("1:01", 1)])
        .await
        .expect("Should add sample");
    let mut events = manager.subscribe();

    manager.start(None).await.expect("Should start");
    manager.wait().await.expect("Run should complete");

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }

    assert!(matches!(
        received.first(),
        Some(QueueEvent::ExecutionStarted { .. })
    ));
    assert!(
        received
            .iter()
            .any(|event| matches!(event, QueueEvent::ExecutionFinished { .. }))
    );
}
