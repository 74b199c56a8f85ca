use std::time::Duration;

use cluster_domain::StreamMessage;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::client::DataStream;

/// 将进程输出按批次转发到数据流
///
/// 满 `batch_size` 行或距上次发送超过 `flush_interval` 时发送一批；
/// 输入通道关闭后发送剩余的行并结束数据流。
pub async fn forward_logs(
    task_id: i64,
    mut lines: mpsc::Receiver<String>,
    stream: DataStream,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut batch: Vec<String> = Vec::with_capacity(batch_size);
    let mut interval = tokio::time::interval(flush_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut healthy = true;

    loop {
        tokio::select! {
            line = lines.recv() => match line {
                Some(line) => {
                    batch.push(line);
                    if batch.len() >= batch_size {
                        healthy = flush(task_id, &stream, &mut batch, healthy).await;
                    }
                }
                None => break,
            },
            _ = interval.tick() => {
                if !batch.is_empty() {
                    healthy = flush(task_id, &stream, &mut batch, healthy).await;
                }
            }
        }
    }

    if !batch.is_empty() {
        flush(task_id, &stream, &mut batch, healthy).await;
    }
    match stream.finish().await {
        Ok(summary) => debug!(
            "任务 {} 的日志流已关闭，主节点接收 {} 行",
            task_id, summary.logs
        ),
        Err(e) => warn!("任务 {} 的日志流异常结束: {}", task_id, e),
    }
}

/// 发送失败时丢弃这一批，只在第一次失败时记录警告
async fn flush(task_id: i64, stream: &DataStream, batch: &mut Vec<String>, healthy: bool) -> bool {
    let lines = std::mem::take(batch);
    match stream.send(&StreamMessage::logs(task_id, lines)).await {
        Ok(()) => healthy,
        Err(e) => {
            if healthy {
                warn!("丢弃任务 {} 的日志: {}", task_id, e);
            }
            false
        }
    }
}
