use std::collections::HashSet;
use std::time::Duration;

use cluster_core::config::DatabaseConfig;
use cluster_domain::{
    NodeRegistration, NodeRepository, Repository, Task, TaskRepository, TaskStatus,
};
use cluster_infrastructure::DatabaseManager;

async fn file_database(dir: &tempfile::TempDir) -> DatabaseManager {
    database_with_pool(dir, 8).await
}

async fn database_with_pool(dir: &tempfile::TempDir, max_connections: u32) -> DatabaseManager {
    let config = DatabaseConfig {
        url: format!("sqlite://{}", dir.path().join("claims.db").display()),
        max_connections,
        ..DatabaseConfig::default()
    };
    DatabaseManager::connect(&config).await.unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_of_one_task_succeed_once() {
    let dir = tempfile::tempdir().unwrap();
    let db = file_database(&dir).await;
    let store = db.store();
    let task = store.tasks.insert_with_stat(&Task::new(1)).await.unwrap();

    let mut handles = Vec::new();
    for node_id in 1..=8 {
        let tasks = store.tasks.clone();
        handles.push(tokio::spawn(async move { tasks.claim_next(node_id).await }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        if let Some(task_id) = handle.await.unwrap().unwrap() {
            winners.push(task_id);
        }
    }

    assert_eq!(winners, vec![task.id]);
    let stored = store.tasks.get(task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Assigned);
    assert_ne!(stored.node_id, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_never_share_a_task() {
    let dir = tempfile::tempdir().unwrap();
    let db = file_database(&dir).await;
    let store = db.store();
    for priority in 0..20 {
        store
            .tasks
            .insert_with_stat(&Task::new(1).with_priority(priority % 4))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for node_id in 1..=4 {
        let tasks = store.tasks.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(task_id) = tasks.claim_next(node_id).await.unwrap() {
                claimed.push(task_id);
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let unique: HashSet<i64> = all.iter().copied().collect();
    assert_eq!(all.len(), 20);
    assert_eq!(unique.len(), 20);
    assert!(store.tasks.list_by_status(TaskStatus::Pending).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_abandoned_claims_release_the_write_lock() {
    let dir = tempfile::tempdir().unwrap();
    // 单连接：被丢弃的领取一定把同一个连接还回连接池
    let db = database_with_pool(&dir, 1).await;
    let store = db.store();
    for _ in 0..11 {
        store.tasks.insert_with_stat(&Task::new(1)).await.unwrap();
    }

    for step in 0..10u64 {
        let tasks = store.tasks.clone();
        let handle = tokio::spawn(async move { tasks.claim_next(1).await });
        tokio::time::sleep(Duration::from_micros(step * 200)).await;
        handle.abort();
        let _ = handle.await;
    }

    let claimed = tokio::time::timeout(Duration::from_secs(10), store.tasks.claim_next(2))
        .await
        .expect("claim blocked by an abandoned transaction")
        .unwrap();
    let task_id = claimed.expect("at least one task is still pending");
    assert_eq!(store.tasks.get(task_id).await.unwrap().node_id, 2);

    let inserted = tokio::time::timeout(
        Duration::from_secs(10),
        store.tasks.insert_with_stat(&Task::new(1)),
    )
    .await
    .expect("write blocked by an abandoned transaction");
    assert!(inserted.is_ok());
}

#[tokio::test]
async fn test_store_survives_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = file_database(&dir).await;
        db.store()
            .nodes
            .upsert_online(&NodeRegistration {
                key: "w1".to_string(),
                name: "worker".to_string(),
                max_runners: 2,
                is_master: false,
            })
            .await
            .unwrap();
        db.close().await;
    }

    let db = file_database(&dir).await;
    let node = db.store().nodes.find_by_key("w1").await.unwrap().unwrap();
    assert_eq!(node.max_runners, 2);
}
