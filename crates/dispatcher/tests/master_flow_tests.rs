use std::sync::Arc;

use cluster_core::config::{DatabaseConfig, SchedulerConfig};
use cluster_dispatcher::{NodeRegistry, TaskDispatchService, TaskScheduler};
use cluster_domain::{
    NodeRepository, NodeStatus, PushMessage, RegisterRequest, Repository, Task, TaskRepository, TaskStatus,
};
use cluster_infrastructure::{DatabaseManager, FileLogDriver, TracingNotificationSink};

struct Master {
    _dir: tempfile::TempDir,
    db: DatabaseManager,
    registry: Arc<NodeRegistry>,
    dispatch: TaskDispatchService,
    scheduler: TaskScheduler,
}

async fn master() -> Master {
    let dir = tempfile::tempdir().unwrap();
    let config = DatabaseConfig {
        url: format!("sqlite://{}", dir.path().join("master.db").display()),
        ..DatabaseConfig::default()
    };
    let db = DatabaseManager::connect(&config).await.unwrap();
    let store = db.store();
    let notifier = Arc::new(TracingNotificationSink);
    let registry = Arc::new(NodeRegistry::new(store.clone(), notifier.clone()));
    let dispatch = TaskDispatchService::new(
        store.clone(),
        Arc::new(FileLogDriver::new(dir.path().join("logs"))),
        notifier.clone(),
    );
    let scheduler = TaskScheduler::new(
        store,
        Arc::clone(&registry),
        dispatch.task_streams(),
        notifier,
        SchedulerConfig::default(),
    );
    Master {
        _dir: dir,
        db,
        registry,
        dispatch,
        scheduler,
    }
}

fn worker(key: &str, max_runners: i32) -> RegisterRequest {
    RegisterRequest {
        node_key: key.to_string(),
        node_name: key.to_string(),
        max_runners,
        is_master: false,
    }
}

#[tokio::test]
async fn test_capacity_limits_fetch_for_single_runner_node() {
    let m = master().await;
    m.registry.register(&worker("w1", 1)).await.unwrap();

    let _t1 = m
        .scheduler
        .enqueue(Task::new(1).with_priority(5), "tester")
        .await
        .unwrap();
    let t2 = m
        .scheduler
        .enqueue(Task::new(1).with_priority(1), "tester")
        .await
        .unwrap();

    assert_eq!(m.dispatch.fetch_task("w1").await.unwrap(), Some(t2.id));
    assert_eq!(m.dispatch.fetch_task("w1").await.unwrap(), None);
}

#[tokio::test]
async fn test_priority_order_across_sequential_claims() {
    let m = master().await;
    m.registry.register(&worker("w1", 10)).await.unwrap();

    let mut ids = Vec::new();
    for priority in [5, 1, 3] {
        let task = m
            .scheduler
            .enqueue(Task::new(1).with_priority(priority), "tester")
            .await
            .unwrap();
        ids.push(task.id);
    }

    let mut claimed = Vec::new();
    while let Some(id) = m.dispatch.fetch_task("w1").await.unwrap() {
        claimed.push(id);
    }
    assert_eq!(claimed, vec![ids[1], ids[2], ids[0]]);
}

#[tokio::test]
async fn test_cancel_reaches_subscribed_worker() {
    let m = master().await;
    let w1 = m.registry.register(&worker("w1", 2)).await.unwrap();
    let mut node_stream = m.registry.subscribe("w1").await.unwrap();

    let task = m.scheduler.enqueue(Task::new(1), "tester").await.unwrap();
    let claimed = m.dispatch.fetch_task("w1").await.unwrap();
    assert_eq!(claimed, Some(task.id));

    m.scheduler.cancel(task.id, "tester", false).await.unwrap();
    assert_eq!(
        node_stream.recv().await,
        Some(PushMessage::Cancel {
            task_id: task.id,
            force: false
        })
    );

    let store = m.db.store();
    let stored = store.tasks.get(task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Assigned);
    assert_eq!(stored.node_id, w1.id);
}

#[tokio::test]
async fn test_reregistration_after_offline_restores_status() {
    let m = master().await;
    let w1 = m.registry.register(&worker("w1", 2)).await.unwrap();
    let store = m.db.store();
    store.nodes.mark_offline(w1.id).await.unwrap();

    let again = m.registry.register(&worker("w1", 3)).await.unwrap();
    assert_eq!(again.id, w1.id);
    assert_eq!(again.status, NodeStatus::Online);
    assert_eq!(again.max_runners, 3);
}
