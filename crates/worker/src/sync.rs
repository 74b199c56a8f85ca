//! 工作节点文件同步
//!
//! 以主节点清单为准：删除本地多余的条目，创建缺失的目录，下载缺失或
//! 哈希不同的文件。主节点目录未变化时重复同步不产生任何操作。

use std::path::{Path, PathBuf};

use cluster_core::{ClusterError, ClusterResult};
use cluster_domain::{FileEntry, FileListing};
use cluster_infrastructure::workspace::{resolve_within, scan_dir};
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, info};

use crate::client::ControlPlaneClient;

/// 一次同步的操作统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub downloaded: usize,
    pub deleted: usize,
    pub created_dirs: usize,
}

impl SyncReport {
    pub fn is_noop(&self) -> bool {
        *self == SyncReport::default()
    }
}

/// 将主节点 `owner_id` 目录同步到 `local_root`
pub async fn sync_files(
    client: &ControlPlaneClient,
    owner_id: &str,
    local_root: &Path,
    concurrency: usize,
) -> ClusterResult<SyncReport> {
    let remote = client.scan(owner_id, "").await?;
    tokio::fs::create_dir_all(local_root).await?;
    let local = scan_local(local_root.to_path_buf()).await?;

    let mut report = SyncReport::default();

    // 路径倒序：先删除子项再删除目录
    for (path, entry) in local.iter().rev() {
        let stale = match remote.get(path) {
            None => true,
            Some(remote_entry) => remote_entry.is_dir != entry.is_dir,
        };
        if stale && remove_entry(local_root, entry).await? {
            report.deleted += 1;
        }
    }

    for (path, entry) in remote.iter().filter(|(_, e)| e.is_dir) {
        let target = resolve_within(local_root, path)?;
        if !tokio::fs::try_exists(&target).await? {
            tokio::fs::create_dir_all(&target).await?;
            report.created_dirs += 1;
            debug!("创建目录 {}", entry.path);
        }
    }

    let downloads: Vec<FileEntry> = remote
        .values()
        .filter(|entry| !entry.is_dir)
        .filter(|entry| match local.get(&entry.path) {
            Some(local_entry) => local_entry.is_dir || local_entry.hash != entry.hash,
            None => true,
        })
        .cloned()
        .collect();

    report.downloaded = stream::iter(downloads)
        .map(|entry| async move { download(client, owner_id, local_root, &entry).await })
        .buffer_unordered(concurrency.max(1))
        .try_fold(0usize, |count, ()| async move { Ok(count + 1) })
        .await?;

    info!(
        "同步 {} 到 {}: 下载 {} 个文件，删除 {} 项，创建 {} 个目录",
        owner_id,
        local_root.display(),
        report.downloaded,
        report.deleted,
        report.created_dirs
    );
    Ok(report)
}

async fn scan_local(root: PathBuf) -> ClusterResult<FileListing> {
    tokio::task::spawn_blocking(move || scan_dir(&root))
        .await
        .map_err(|e| ClusterError::Internal(format!("scan task failed: {e}")))?
}

async fn remove_entry(root: &Path, entry: &FileEntry) -> ClusterResult<bool> {
    let target = resolve_within(root, &entry.path)?;
    let result = if entry.is_dir {
        tokio::fs::remove_dir_all(&target).await
    } else {
        tokio::fs::remove_file(&target).await
    };
    match result {
        Ok(()) => {
            debug!("删除 {}", entry.path);
            Ok(true)
        }
        // 父目录已被删除
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

async fn download(
    client: &ControlPlaneClient,
    owner_id: &str,
    root: &Path,
    entry: &FileEntry,
) -> ClusterResult<()> {
    let target = resolve_within(root, &entry.path)?;
    let bytes = client.download_to(owner_id, &entry.path, &target).await?;
    apply_mode(&target, entry.mode)?;
    debug!("下载 {}（{} 字节）", entry.path, bytes);
    Ok(())
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: u32) -> ClusterResult<()> {
    use std::os::unix::fs::PermissionsExt;
    if mode != 0 {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: u32) -> ClusterResult<()> {
    Ok(())
}
