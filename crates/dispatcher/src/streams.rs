use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use cluster_core::{ClusterError, ClusterResult};
use cluster_domain::PushMessage;
use tokio::sync::mpsc;
use tracing::debug;

const STREAM_BUFFER: usize = 16;
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

struct PushStream {
    generation: u64,
    sender: mpsc::Sender<PushMessage>,
}

/// 推送流表：key（节点 id 或任务 id）到下行通道
///
/// 只通过 add/get/delete 修改，锁不会跨越任何等待点。
pub struct StreamTable {
    name: &'static str,
    streams: Mutex<HashMap<i64, PushStream>>,
    next_generation: AtomicU64,
}

impl StreamTable {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            streams: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<i64, PushStream>> {
        self.streams.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 为 key 注册新的下行流，替换已有的流
    pub fn add(self: &Arc<Self>, key: i64) -> Subscription {
        let (sender, receiver) = mpsc::channel(STREAM_BUFFER);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let replaced = self
            .lock()
            .insert(key, PushStream { generation, sender })
            .is_some();
        debug!(
            "{} 推送流已添加: {}（代数 {}，替换旧流: {}）",
            self.name, key, generation, replaced
        );

        Subscription {
            key,
            receiver,
            guard: StreamGuard {
                table: Arc::clone(self),
                key,
                generation,
            },
        }
    }

    pub fn get(&self, key: i64) -> Option<mpsc::Sender<PushMessage>> {
        self.lock().get(&key).map(|stream| stream.sender.clone())
    }

    /// 只删除指定代次的流，避免旧连接断开时删掉重连后的新流
    pub fn delete(&self, key: i64, generation: u64) -> bool {
        let mut streams = self.lock();
        match streams.get(&key) {
            Some(stream) if stream.generation == generation => {
                streams.remove(&key);
                debug!("{} 推送流已移除: {}", self.name, key);
                true
            }
            _ => false,
        }
    }

    /// 移除全部流，对应的订阅随即结束
    pub fn clear(&self) {
        let removed = {
            let mut streams = self.lock();
            let count = streams.len();
            streams.clear();
            count
        };
        debug!("{} 推送流已清空（移除 {} 个）", self.name, removed);
    }

    pub fn contains(&self, key: i64) -> bool {
        self.lock().contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 发送一条消息；流不存在、接收端已关闭或发送超时都视为失败
    pub async fn send(&self, key: i64, message: PushMessage) -> ClusterResult<()> {
        let sender = self.get(key).ok_or_else(|| {
            ClusterError::Transport(format!("no {} stream for {}", self.name, key))
        })?;

        match tokio::time::timeout(SEND_TIMEOUT, sender.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ClusterError::Transport(format!(
                "{} stream for {} is closed",
                self.name, key
            ))),
            Err(_) => Err(ClusterError::Transport(format!(
                "{} stream for {} timed out",
                self.name, key
            ))),
        }
    }
}

struct StreamGuard {
    table: Arc<StreamTable>,
    key: i64,
    generation: u64,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.table.delete(self.key, self.generation);
    }
}

/// 一个打开的下行流；丢弃时从流表中移除
pub struct Subscription {
    key: i64,
    receiver: mpsc::Receiver<PushMessage>,
    guard: StreamGuard,
}

impl Subscription {
    pub fn key(&self) -> i64 {
        self.key
    }

    pub fn generation(&self) -> u64 {
        self.guard.generation
    }

    pub async fn recv(&mut self) -> Option<PushMessage> {
        self.receiver.recv().await
    }
}
