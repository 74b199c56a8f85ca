use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cluster_domain::{NotificationEvent, NotificationSink, Store};
use cluster_infrastructure::DatabaseManager;

pub async fn test_store() -> (DatabaseManager, Store) {
    let db = DatabaseManager::in_memory().await.unwrap();
    let store = db.store();
    (db, store)
}

/// 记录所有通知，供断言使用
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<NotificationEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().unwrap().clone()
    }

    /// 通知在后台投递，等待至少 `count` 条到达
    pub async fn wait_for(&self, count: usize) -> Vec<NotificationEvent> {
        for _ in 0..100 {
            let events = self.events();
            if events.len() >= count {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.events()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn notify(&self, event: NotificationEvent) {
        self.events.lock().unwrap().push(event);
    }
}
