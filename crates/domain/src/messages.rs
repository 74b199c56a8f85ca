//! 控制平面消息
//!
//! 一元调用使用 JSON 请求/响应体，流式调用按行传输（NDJSON）。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 主节点下推给节点（或单个任务）的消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PushMessage {
    /// 存活探测，接收方忽略
    Ping,
    Cancel {
        #[serde(rename = "taskId")]
        task_id: i64,
        force: bool,
    },
}

/// 任务数据流的消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamCode {
    InsertData,
    InsertLogs,
}

/// 任务数据流中的一条消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMessage {
    pub code: StreamCode,
    pub task_id: i64,
    #[serde(default)]
    pub data: Vec<serde_json::Value>,
}

impl StreamMessage {
    pub fn logs(task_id: i64, lines: Vec<String>) -> Self {
        Self {
            code: StreamCode::InsertLogs,
            task_id,
            data: lines.into_iter().map(serde_json::Value::String).collect(),
        }
    }

    pub fn data(task_id: i64, records: Vec<serde_json::Value>) -> Self {
        Self {
            code: StreamCode::InsertData,
            task_id,
            data: records,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub node_key: String,
    pub node_name: String,
    pub max_runners: i32,
    #[serde(default)]
    pub is_master: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeKeyRequest {
    pub node_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchTaskResponse {
    pub task_id: Option<i64>,
}

/// 一次数据流连接处理的消息统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectSummary {
    pub messages: u64,
    pub logs: u64,
    pub records: u64,
}

/// 文件同步清单中的一项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    /// 相对于同步根目录，使用 `/` 分隔
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub mod_time: DateTime<Utc>,
    pub mode: u32,
    /// 目录为空字符串
    pub hash: String,
}

/// 相对路径到文件信息的映射
pub type FileListing = BTreeMap<String, FileEntry>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_message_wire_format() {
        let cancel = PushMessage::Cancel {
            task_id: 42,
            force: true,
        };
        assert_eq!(
            serde_json::to_value(&cancel).unwrap(),
            serde_json::json!({"type": "cancel", "taskId": 42, "force": true})
        );
        assert_eq!(
            serde_json::from_str::<PushMessage>(r#"{"type":"ping"}"#).unwrap(),
            PushMessage::Ping
        );
    }

    #[test]
    fn test_stream_message_wire_format() {
        let msg = StreamMessage::logs(7, vec!["hello".to_string()]);
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            serde_json::json!({"code": "INSERT_LOGS", "taskId": 7, "data": ["hello"]})
        );

        let parsed: StreamMessage =
            serde_json::from_str(r#"{"code":"INSERT_DATA","taskId":3}"#).unwrap();
        assert_eq!(parsed.code, StreamCode::InsertData);
        assert!(parsed.data.is_empty());
    }

    #[test]
    fn test_fetch_response_null_task() {
        let json = serde_json::to_string(&FetchTaskResponse::default()).unwrap();
        assert_eq!(json, r#"{"taskId":null}"#);
    }
}
