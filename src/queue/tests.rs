#[cfg(test)]
mod tests {
    use crate::device::{DeviceCall, DeviceOutcome, SimulatedDevice};
    use crate::error::QueueError;
    use crate::queue::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn fast_config() -> QueueConfig {
        QueueConfig {
            simulation: SimulationConfig {
                image_delay_ms: 1,
                mount_delay_ms: 1,
                task_delay_ms: 1,
            },
            ..QueueConfig::default()
        }
    }

    fn dc(images: u32) -> TaskItem {
        TaskItem::data_collection(json!({ "num_images": images, "prefix": "x1" }))
    }

    fn simulated() -> (QueueManager, Arc<SimulatedDevice>) {
        QueueManager::with_simulated_device(&fast_config())
    }

    fn gated() -> (QueueManager, Arc<SimulatedDevice>) {
        QueueManager::with_device(&fast_config(), |bus| SimulatedDevice::new(bus).gated())
    }

    /// Add one sample with `count` data collections, returning the task ids
    async fn sample_with_tasks(manager: &QueueManager, sample_id: &str, count: usize) -> Vec<NodeId> {
        manager
            .add_sample(SampleItem::new(sample_id, format!("crystal-{}", sample_id)))
            .await
            .unwrap();

        let mut ids = Vec::new();
        for _ in 0..count {
            ids.push(manager.add_task(sample_id, dc(3)).await.unwrap());
        }
        ids
    }

    async fn task_ids(manager: &QueueManager, sample_id: &str) -> Vec<NodeId> {
        manager
            .get_sample(sample_id)
            .await
            .unwrap()
            .tasks
            .iter()
            .map(|task| task.queue_id)
            .collect()
    }

    #[tokio::test]
    async fn test_add_items_assigns_sequential_run_numbers() {
        let (manager, _) = simulated();

        let sample = SampleItem::new("1:01", "lysozyme")
            .with_task(dc(5))
            .with_task(dc(5))
            .with_task(dc(5));
        let snapshot = manager.add_items(vec![sample]).await.unwrap();

        assert_eq!(snapshot.sample_order, vec!["1:01".to_string()]);
        let runs: Vec<u64> = snapshot.samples["1:01"]
            .tasks
            .iter()
            .map(|task| task.parameters["run_number"].as_u64().unwrap())
            .collect();
        assert_eq!(runs, vec![1, 2, 3]);
        assert_eq!(snapshot.task_count(), 3);
    }

    #[tokio::test]
    async fn test_failed_batch_leaves_queue_untouched() {
        let (manager, _) = simulated();
        sample_with_tasks(&manager, "1:01", 1).await;
        let version = manager.read(|state| state.tree.version()).await;

        let mut broken = SampleItem::new("1:02", "broken");
        broken.location = "nowhere".to_string();
        let result = manager
            .add_items(vec![SampleItem::new("1:03", "fine").with_task(dc(1)), broken])
            .await;

        assert!(matches!(result, Err(QueueError::InvalidItem(_))));
        let snapshot = manager.snapshot().await.unwrap();
        assert_eq!(snapshot.sample_order, vec!["1:01".to_string()]);
        assert_eq!(manager.read(|state| state.tree.version()).await, version);
    }

    #[tokio::test]
    async fn test_swap_disable_and_run() {
        let (manager, device) = simulated();
        let ids = sample_with_tasks(&manager, "1:01", 3).await;
        let (a, b, c) = (ids[0], ids[1], ids[2]);
        let sample_node = manager.get_sample("1:01").await.unwrap().queue_id;

        manager.set_enabled(b, false).await.unwrap();
        manager.swap_task("1:01", 0, 2).await.unwrap();
        assert_eq!(task_ids(&manager, "1:01").await, vec![c, b, a]);

        manager.start(Some(sample_node)).await.unwrap();
        let summary = manager.wait().await.unwrap();

        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.final_state, ExecState::Idle);
        assert_eq!(device.executed_nodes(), vec![c, a]);

        let sample = manager.get_sample("1:01").await.unwrap();
        let states: Vec<NodeState> = sample.tasks.iter().map(|task| task.state).collect();
        assert_eq!(
            states,
            vec![NodeState::Collected, NodeState::Uncollected, NodeState::Collected]
        );
        assert_eq!(sample.state, NodeState::Collected);
        assert_eq!(manager.exec_state().await, ExecState::Idle);
    }

    #[tokio::test]
    async fn test_interleaved_absorbs_existing_tasks() {
        let (manager, _) = simulated();
        let ids = sample_with_tasks(&manager, "1:01", 5).await;

        let group = manager
            .add_interleaved(
                "1:01",
                json!({ "swNumImages": 2, "taskIndexList": [1, 3, 4] }),
            )
            .await
            .unwrap();

        let sample = manager.get_sample("1:01").await.unwrap();
        let order: Vec<NodeId> = sample.tasks.iter().map(|task| task.queue_id).collect();
        assert_eq!(order, vec![ids[0], group, ids[2]]);

        let interleaved = &sample.tasks[1];
        assert_eq!(interleaved.task_type, TaskType::Interleaved);
        assert_eq!(interleaved.parameters["wedges"].as_array().unwrap().len(), 3);
        assert_eq!(interleaved.parameters["swNumImages"], json!(2));

        for removed in [ids[1], ids[3], ids[4]] {
            assert!(!manager.read(|state| state.tree.contains(removed)).await);
        }
        assert!(manager.read(|state| state.tree.validate_integrity()).await.is_empty());
    }

    #[tokio::test]
    async fn test_interleaved_run_reports_group_progress() {
        let (manager, device) = simulated();
        manager
            .add_sample(SampleItem::new("1:01", "crystal"))
            .await
            .unwrap();
        let group = manager
            .add_interleaved(
                "1:01",
                json!({ "swNumImages": 2, "wedges": [
                    { "type": "DataCollection", "parameters": { "num_images": 2 } },
                    { "type": "DataCollection", "parameters": { "num_images": 2 } }
                ]}),
            )
            .await
            .unwrap();
        let mut events = manager.subscribe();

        manager.start(None).await.unwrap();
        manager.wait().await.unwrap();

        let wedges = manager
            .read(|state| state.tree.children(group).unwrap().to_vec())
            .await;
        assert_eq!(device.executed_nodes(), wedges);

        let mut done = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let QueueEvent::InterleavedWedgeDone { group_id, wedge_index } = event {
                assert_eq!(group_id, group);
                done.push(wedge_index);
            }
        }
        assert_eq!(done, vec![0, 1]);

        let view = manager.get_task("1:01", group).await.unwrap();
        assert_eq!(view.state, NodeState::Collected);
        assert_eq!(view.progress, 1.0);
    }

    #[tokio::test]
    async fn test_stop_marks_only_the_executing_task() {
        let (manager, device) = gated();
        let ids = sample_with_tasks(&manager, "1:01", 2).await;

        manager.start(None).await.unwrap();
        device.wait_until_executing(ids[0]).await;
        manager.stop().await.unwrap();

        let summary = manager.wait().await.unwrap();
        assert_eq!(summary.final_state, ExecState::Stopped);
        assert_eq!(manager.exec_state().await, ExecState::Stopped);

        let (first, second) = manager
            .read(|state| {
                (
                    state.tree.entry(ids[0]).unwrap().clone(),
                    state.tree.entry(ids[1]).unwrap().clone(),
                )
            })
            .await;
        assert!(!first.enabled);
        assert!(first.executed);
        assert_eq!(first.status, EntryStatus::Failed);
        assert!(second.enabled);
        assert_eq!(second.status, EntryStatus::Queued);
        assert!(device.calls().contains(&DeviceCall::Interrupt));

        // A stopped engine can start again and picks up what is left
        device.release(1);
        manager.start(None).await.unwrap();
        let summary = manager.wait().await.unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(device.executed_nodes(), vec![ids[0], ids[1]]);
    }

    #[tokio::test]
    async fn test_skip_continues_and_failure_stops() {
        let (manager, device) = simulated();
        let ids = sample_with_tasks(&manager, "1:01", 4).await;
        device.set_outcome(ids[1], DeviceOutcome::Skip("no diffraction".to_string()));
        device.set_outcome(ids[2], DeviceOutcome::Failure("detector fault".to_string()));

        manager.start(None).await.unwrap();
        let result = manager.wait().await;

        assert!(matches!(
            result,
            Err(QueueError::HardFailure { node_id, .. }) if node_id == ids[2]
        ));
        assert_eq!(device.executed_nodes(), vec![ids[0], ids[1], ids[2]]);
        assert_eq!(manager.exec_state().await, ExecState::Failed);

        let summary = manager
            .read(|state| state.status.last_summary.clone())
            .await
            .unwrap();
        assert_eq!((summary.succeeded, summary.skipped, summary.failed), (1, 1, 1));

        let skipped = manager.read(|state| state.tree.entry(ids[1]).unwrap().clone()).await;
        assert!(!skipped.executed);
        assert!(skipped.enabled);

        assert!(matches!(manager.start(None).await, Err(QueueError::EngineFailed)));
        manager.reset().await.unwrap();
        assert_eq!(manager.exec_state().await, ExecState::Idle);
    }

    #[tokio::test]
    async fn test_pause_holds_the_next_task() {
        let (manager, device) = gated();
        let ids = sample_with_tasks(&manager, "1:01", 2).await;
        let mut events = manager.subscribe();

        manager.start(None).await.unwrap();
        device.wait_until_executing(ids[0]).await;
        manager.pause().await.unwrap();
        assert!(matches!(
            manager.start(None).await,
            Err(QueueError::EngineBusy(ExecState::Paused))
        ));
        device.release(1);

        loop {
            match events.recv().await {
                Some(QueueEvent::EntryFinished { node_id, .. }) if node_id == ids[0] => break,
                Some(_) => continue,
                None => panic!("event bus closed"),
            }
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(device.executed_nodes(), vec![ids[0]]);
        assert_eq!(manager.exec_state().await, ExecState::Paused);

        manager.resume().await.unwrap();
        device.release(1);
        let summary = manager.wait().await.unwrap();
        assert_eq!(summary.succeeded, 2);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let (manager, _) = simulated();
        let ids = sample_with_tasks(&manager, "1:01", 0).await;
        assert!(ids.is_empty());
        let task = manager.add_task("1:01", dc(6)).await.unwrap();
        let mut events = manager.subscribe();

        manager.start(None).await.unwrap();
        manager.wait().await.unwrap();

        let mut fractions = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let QueueEvent::Progress { node_id, fraction } = event {
                assert_eq!(node_id, task);
                fractions.push(fraction);
            }
        }
        assert_eq!(fractions.len(), 6);
        assert!(fractions.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(fractions.last().copied(), Some(1.0));
    }

    #[tokio::test]
    async fn test_subtree_run_touches_only_its_target() {
        let (manager, device) = simulated();
        sample_with_tasks(&manager, "1:01", 2).await;
        let other = sample_with_tasks(&manager, "1:02", 2).await;

        manager.start(Some(other[1])).await.unwrap();
        let summary = manager.wait().await.unwrap();

        assert_eq!(summary.target, Some(other[1]));
        assert_eq!(
            device.calls(),
            vec![
                DeviceCall::Mount("1:02".to_string()),
                DeviceCall::Execute(other[1]),
            ]
        );
    }

    #[tokio::test]
    async fn test_auto_mount_runs_the_whole_queue() {
        let (manager, device) = simulated();
        let first = sample_with_tasks(&manager, "1:01", 1).await;
        let second = sample_with_tasks(&manager, "1:02", 1).await;
        manager.set_auto_mount_next(true).await;

        let sample_node = manager.get_sample("1:02").await.unwrap().queue_id;
        manager.start(Some(sample_node)).await.unwrap();
        manager.wait().await.unwrap();

        assert_eq!(device.executed_nodes(), vec![first[0], second[0]]);
        assert_eq!(
            manager.queue_state().await.current,
            Some("1:02".to_string())
        );
    }

    #[tokio::test]
    async fn test_mount_failure_fails_the_engine() {
        let (manager, device) = simulated();
        sample_with_tasks(&manager, "1:01", 1).await;
        device.fail_mount("1:01");

        manager.start(None).await.unwrap();
        assert!(matches!(manager.wait().await, Err(QueueError::Device(_))));
        assert_eq!(manager.exec_state().await, ExecState::Failed);
        assert!(device.executed_nodes().is_empty());
    }

    #[tokio::test]
    async fn test_running_task_cannot_be_deleted() {
        let (manager, device) = gated();
        let ids = sample_with_tasks(&manager, "1:01", 1).await;

        manager.start(None).await.unwrap();
        device.wait_until_executing(ids[0]).await;

        assert!(matches!(
            manager.delete_node(ids[0]).await,
            Err(QueueError::EngineBusy(ExecState::Running))
        ));
        assert!(matches!(
            manager.set_enabled(ids[0], false).await,
            Err(QueueError::EngineBusy(ExecState::Running))
        ));
        assert!(matches!(
            manager.toggle_node(ids[0]).await,
            Err(QueueError::EngineBusy(ExecState::Running))
        ));
        assert!(manager.get_sample("1:01").await.unwrap().tasks[0].checked);
        assert!(matches!(
            manager.clear().await,
            Err(QueueError::EngineBusy(ExecState::Running))
        ));

        device.release(1);
        manager.wait().await.unwrap();
        manager.delete_node(ids[0]).await.unwrap();
        assert!(manager.get_sample("1:01").await.unwrap().tasks.is_empty());
    }

    #[tokio::test]
    async fn test_enable_items_checks_every_id_first() {
        let (manager, _) = simulated();
        let ids = sample_with_tasks(&manager, "1:01", 2).await;
        let version = manager.read(|state| state.tree.version()).await;

        let result = manager.enable_items(&[ids[0], 9999, ids[1]], false).await;
        assert!(matches!(result, Err(QueueError::NotFound(9999))));
        assert_eq!(manager.read(|state| state.tree.version()).await, version);
        let sample = manager.get_sample("1:01").await.unwrap();
        assert!(sample.tasks.iter().all(|task| task.checked));

        manager.enable_items(&ids, false).await.unwrap();
        let sample = manager.get_sample("1:01").await.unwrap();
        assert!(sample.tasks.iter().all(|task| !task.checked));
        assert!(sample.checked);
    }

    #[tokio::test]
    async fn test_delete_task_at_removes_whole_container() {
        let (manager, _) = simulated();
        let ids = sample_with_tasks(&manager, "1:01", 5).await;
        let group = manager
            .add_interleaved(
                "1:01",
                json!({ "swNumImages": 2, "taskIndexList": [1, 3, 4] }),
            )
            .await
            .unwrap();
        let wedges = manager
            .read(|state| state.tree.children(group).unwrap().to_vec())
            .await;

        let removed = manager.delete_task_at("1:01", 1).await.unwrap();
        assert!(removed.contains(&group));
        for wedge in &wedges {
            assert!(!manager.read(|state| state.tree.contains(*wedge)).await);
        }
        assert_eq!(task_ids(&manager, "1:01").await, vec![ids[0], ids[2]]);

        let first_group = manager
            .read(|state| state.tree.parent(ids[0]).unwrap().unwrap())
            .await;
        manager.delete_task_at("1:01", 0).await.unwrap();
        assert!(!manager.read(|state| state.tree.contains(first_group)).await);
        assert_eq!(task_ids(&manager, "1:01").await, vec![ids[2]]);

        assert!(matches!(
            manager.delete_task_at("1:01", 5).await,
            Err(QueueError::InvalidIndex { index: 5, len: 1 })
        ));
        assert!(manager.read(|state| state.tree.validate_integrity()).await.is_empty());
    }

    #[tokio::test]
    async fn test_add_tasks_prefers_sample_queue_id() {
        let (manager, _) = simulated();
        sample_with_tasks(&manager, "1:01", 0).await;
        sample_with_tasks(&manager, "1:02", 0).await;
        let second = manager.get_sample("1:02").await.unwrap().queue_id;

        let mut by_queue_id = dc(1).for_sample("1:01");
        by_queue_id.sample_queue_id = Some(second);
        let by_sample_id = dc(1).for_sample("1:01");
        let mut stale_queue_id = dc(1).for_sample("1:02");
        stale_queue_id.sample_queue_id = Some(9999);

        let added = manager
            .add_tasks(vec![by_queue_id, by_sample_id, stale_queue_id])
            .await
            .unwrap();

        assert_eq!(task_ids(&manager, "1:01").await, vec![added[1]]);
        assert_eq!(task_ids(&manager, "1:02").await, vec![added[0], added[2]]);

        let version = manager.read(|state| state.tree.version()).await;
        let result = manager
            .add_tasks(vec![dc(1).for_sample("1:01"), dc(1).for_sample("9:99")])
            .await;
        assert!(matches!(result, Err(QueueError::SampleNotFound(id)) if id == "9:99"));
        assert_eq!(manager.read(|state| state.tree.version()).await, version);
    }

    #[tokio::test]
    async fn test_diffraction_plan_is_stored_then_promoted() {
        let (manager, device) = simulated();
        manager
            .add_sample(SampleItem::new("1:01", "crystal"))
            .await
            .unwrap();
        let characterisation = manager
            .add_characterisation("1:01", json!({ "num_images": 2 }))
            .await
            .unwrap();
        device.set_diffraction_plan(
            characterisation,
            vec![AcquisitionParameters {
                num_images: 4,
                ..AcquisitionParameters::default()
            }],
        );

        manager.start(None).await.unwrap();
        manager.wait().await.unwrap();

        let view = manager.get_task("1:01", characterisation).await.unwrap();
        assert_eq!(view.diffraction_plan.as_ref().map(Vec::len), Some(1));
        assert_eq!(view.diffraction_plan_id, Some(characterisation as i64));

        let promoted = manager.promote_diffraction_plan(characterisation).await.unwrap();
        assert_eq!(promoted.len(), 1);

        let sample = manager.get_sample("1:01").await.unwrap();
        assert_eq!(sample.tasks.len(), 2);
        assert_eq!(sample.tasks[1].is_diffraction_plan, Some(true));
        assert_eq!(sample.tasks[1].num_images(), Some(4));
        assert_eq!(sample.tasks[1].state, NodeState::Uncollected);
    }

    #[tokio::test]
    async fn test_auto_added_plan_runs_in_the_same_pass() {
        let (manager, device) = simulated();
        manager.set_auto_add_diffplan(true).await;
        manager
            .add_sample(SampleItem::new("1:01", "crystal"))
            .await
            .unwrap();
        let characterisation = manager
            .add_characterisation("1:01", json!({ "num_images": 1 }))
            .await
            .unwrap();
        device.set_diffraction_plan(characterisation, vec![AcquisitionParameters::default()]);

        manager.start(None).await.unwrap();
        manager.wait().await.unwrap();

        let executed = device.executed_nodes();
        assert_eq!(executed.len(), 2);
        assert_eq!(executed[0], characterisation);
        let origin = manager
            .read(|state| state.tree.get(executed[1]).unwrap().origin)
            .await;
        assert_eq!(origin, Some(characterisation));
    }

    #[tokio::test]
    async fn test_save_and_load_keeps_order_and_run_numbers() {
        let (manager, _) = simulated();
        sample_with_tasks(&manager, "1:01", 2).await;
        let second = sample_with_tasks(&manager, "1:02", 1).await;
        manager.set_enabled(second[0], false).await.unwrap();
        manager
            .set_sample_order(vec!["1:02".to_string(), "1:01".to_string()])
            .await
            .unwrap();

        let store = MemoryQueueStore::new();
        manager.save(&store, 11).await.unwrap();
        let before = manager.snapshot().await.unwrap();

        manager.clear().await.unwrap();
        assert!(manager.load(&store, 12).await.unwrap().is_none());
        let after = manager.load(&store, 11).await.unwrap().unwrap();

        assert_eq!(after.sample_order, before.sample_order);
        for sample_id in &before.sample_order {
            let old = &before.samples[sample_id];
            let new = &after.samples[sample_id];
            assert_eq!(old.tasks.len(), new.tasks.len());
            for (old_task, new_task) in old.tasks.iter().zip(&new.tasks) {
                assert_eq!(old_task.checked, new_task.checked);
                assert_eq!(
                    old_task.parameters["run_number"],
                    new_task.parameters["run_number"]
                );
                assert_eq!(old_task.parameters["fileName"], new_task.parameters["fileName"]);
            }
        }
    }

    #[tokio::test]
    async fn test_event_handlers_see_control_plane_events() {
        struct Recorder(std::sync::Mutex<Vec<QueueEvent>>);

        impl QueueEventHandler for Recorder {
            fn handle_event(&self, event: &QueueEvent) -> anyhow::Result<()> {
                self.0.lock().unwrap().push(event.clone());
                Ok(())
            }
        }

        let (manager, _) = simulated();
        let recorder = Arc::new(Recorder(std::sync::Mutex::new(Vec::new())));
        manager.add_event_handler(recorder.clone());

        let ids = sample_with_tasks(&manager, "1:01", 1).await;
        manager.toggle_node(ids[0]).await.unwrap();

        let events = recorder.0.lock().unwrap().clone();
        assert!(matches!(events[0], QueueEvent::SampleAdded { .. }));
        assert!(matches!(events[1], QueueEvent::TaskAdded { node_id, .. } if node_id == ids[0]));
        assert_eq!(
            events[2],
            QueueEvent::EnabledChanged {
                node_id: ids[0],
                enabled: false
            }
        );
    }
}
