use std::path::{Path, PathBuf};

use cluster_core::ClusterResult;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const LOG_FILE_NAME: &str = "log.txt";

/// 任务日志文件
///
/// 每个任务一个文件：`<root>/<taskId>/log.txt`，一行一条日志。
pub struct FileLogDriver {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileLogDriver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn log_path(&self, task_id: i64) -> PathBuf {
        self.root.join(task_id.to_string()).join(LOG_FILE_NAME)
    }

    /// 追加日志行
    pub async fn append(&self, task_id: i64, lines: &[String]) -> ClusterResult<()> {
        if lines.is_empty() {
            return Ok(());
        }

        let path = self.log_path(task_id);
        let mut buf = String::new();
        for line in lines {
            buf.push_str(line.trim_end_matches(['\r', '\n']));
            buf.push('\n');
        }

        let _guard = self.write_lock.lock().await;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// 分页读取日志
    ///
    /// `pattern` 非空时只保留包含它的行；`limit` 为 0 表示不限制。
    /// `tail` 模式下 `skip` 从末尾开始计算，返回的行仍按原始顺序排列。
    pub async fn find(
        &self,
        task_id: i64,
        pattern: &str,
        skip: usize,
        limit: usize,
        tail: bool,
    ) -> ClusterResult<Vec<String>> {
        let lines = self.read_lines(task_id, pattern).await?;
        let range = page_range(lines.len(), skip, limit, tail);
        Ok(lines[range].to_vec())
    }

    /// 日志总行数
    pub async fn count(&self, task_id: i64) -> ClusterResult<usize> {
        Ok(self.read_lines(task_id, "").await?.len())
    }

    async fn read_lines(&self, task_id: i64, pattern: &str) -> ClusterResult<Vec<String>> {
        let content = match tokio::fs::read_to_string(self.log_path(task_id)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(content
            .lines()
            .filter(|line| pattern.is_empty() || line.contains(pattern))
            .map(str::to_string)
            .collect())
    }
}

/// 计算分页区间
///
/// 普通模式：`skip >= n` 为空，否则 `[skip, min(skip + limit, n))`。
/// 尾部模式：`skip >= n` 为空，否则 `[max(n - skip - limit, 0), n - skip)`。
fn page_range(n: usize, skip: usize, limit: usize, tail: bool) -> std::ops::Range<usize> {
    if skip >= n {
        return 0..0;
    }
    if tail {
        let end = n - skip;
        let start = if limit == 0 {
            0
        } else {
            end.saturating_sub(limit)
        };
        start..end
    } else {
        let end = if limit == 0 {
            n
        } else {
            skip.saturating_add(limit).min(n)
        };
        skip..end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn driver_with_lines(n: usize) -> (tempfile::TempDir, FileLogDriver) {
        let dir = tempfile::tempdir().unwrap();
        let driver = FileLogDriver::new(dir.path());
        let lines: Vec<String> = (1..=n).map(|i| format!("line {i}")).collect();
        driver.append(1, &lines).await.unwrap();
        (dir, driver)
    }

    #[test]
    fn test_page_range_normal_mode() {
        assert_eq!(page_range(10, 0, 3, false), 0..3);
        assert_eq!(page_range(10, 8, 5, false), 8..10);
        assert_eq!(page_range(10, 10, 5, false), 0..0);
        assert_eq!(page_range(10, 15, 5, false), 0..0);
        assert_eq!(page_range(10, 4, 0, false), 4..10);
        assert_eq!(page_range(0, 0, 0, false), 0..0);
    }

    #[test]
    fn test_page_range_tail_mode() {
        assert_eq!(page_range(10, 0, 3, true), 7..10);
        assert_eq!(page_range(10, 2, 3, true), 5..8);
        assert_eq!(page_range(10, 8, 5, true), 0..2);
        assert_eq!(page_range(10, 10, 5, true), 0..0);
        assert_eq!(page_range(10, 3, 0, true), 0..7);
        assert_eq!(page_range(10, 0, 50, true), 0..10);
    }

    #[tokio::test]
    async fn test_append_and_find() {
        let (_dir, driver) = driver_with_lines(10).await;

        assert_eq!(driver.count(1).await.unwrap(), 10);
        assert_eq!(
            driver.find(1, "", 0, 2, false).await.unwrap(),
            vec!["line 1", "line 2"]
        );
        assert_eq!(
            driver.find(1, "", 0, 2, true).await.unwrap(),
            vec!["line 9", "line 10"]
        );
        assert!(driver.find(1, "", 20, 5, true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pattern_filters_before_paging() {
        let (_dir, driver) = driver_with_lines(12).await;

        let matched = driver.find(1, "line 1", 0, 0, false).await.unwrap();
        assert_eq!(matched, vec!["line 1", "line 10", "line 11", "line 12"]);
        let last = driver.find(1, "line 1", 0, 1, true).await.unwrap();
        assert_eq!(last, vec!["line 12"]);
    }

    #[tokio::test]
    async fn test_missing_log_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FileLogDriver::new(dir.path());
        assert_eq!(driver.count(42).await.unwrap(), 0);
        assert!(driver.find(42, "", 0, 10, false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_appends_accumulate() {
        let (_dir, driver) = driver_with_lines(2).await;
        driver.append(1, &["third\n".to_string()]).await.unwrap();
        assert_eq!(driver.find(1, "", 2, 0, false).await.unwrap(), vec!["third"]);
    }
}
