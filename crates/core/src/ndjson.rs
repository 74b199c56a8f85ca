//! 控制平面流式消息的 NDJSON 帧格式：每行一个 JSON 文档。

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::ClusterResult;

pub const CONTENT_TYPE: &str = "application/x-ndjson";

/// 序列化为单行 JSON，并追加换行符
pub fn encode_line<T: Serialize>(value: &T) -> ClusterResult<Vec<u8>> {
    let mut buf = serde_json::to_vec(value)?;
    buf.push(b'\n');
    Ok(buf)
}

/// 增量行解码器
///
/// 网络分块不一定与行边界对齐，未完成的行保留在缓冲区中等待下一块数据。
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buffer: Vec<u8>,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一块数据并返回其中所有完整的消息，空行会被忽略
    pub fn push<T: DeserializeOwned>(&mut self, chunk: &[u8]) -> ClusterResult<Vec<T>> {
        self.buffer.extend_from_slice(chunk);

        let mut messages = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = trim_line(&line[..line.len() - 1]);
            if line.is_empty() {
                continue;
            }
            messages.push(serde_json::from_slice(line)?);
        }
        Ok(messages)
    }

    /// 流结束时处理没有换行符结尾的最后一行
    pub fn finish<T: DeserializeOwned>(&mut self) -> ClusterResult<Option<T>> {
        let rest = std::mem::take(&mut self.buffer);
        let line = trim_line(&rest);
        if line.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(line)?))
    }

    pub fn has_pending(&self) -> bool {
        !trim_line(&self.buffer).is_empty()
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|p| p + 1)
        .unwrap_or(start);
    &line[start..end.max(start)]
}
