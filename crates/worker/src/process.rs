//! 进程树工具
//!
//! 取消任务时需要连同子孙进程一起终止，并确认它们已经退出。

use cluster_core::{ClusterError, ClusterResult};
use tokio::process::Command;
use tracing::{debug, warn};

/// 进程是否仍然存在；已退出但未回收的僵尸进程视为不存在
pub fn exists(pid: u32) -> bool {
    platform::exists(pid)
}

/// 直接子进程
pub fn children(pid: u32) -> Vec<u32> {
    platform::children(pid)
}

/// 全部子孙进程，按深度优先后序排列（最深的在前）
pub fn descendants(pid: u32) -> Vec<u32> {
    let mut ordered = Vec::new();
    collect_descendants(pid, &mut ordered, 0);
    ordered
}

fn collect_descendants(pid: u32, ordered: &mut Vec<u32>, depth: usize) {
    // 进程表在遍历期间可能变化，限制深度防止异常的父子环
    if depth > 64 {
        return;
    }
    for child in children(pid) {
        if child == pid || ordered.contains(&child) {
            continue;
        }
        collect_descendants(child, ordered, depth + 1);
        ordered.push(child);
    }
}

/// 深度优先终止整棵进程树：先子孙、后自身
///
/// `force` 为 true 时立即杀死，否则请求正常退出。
pub async fn kill_tree(pid: u32, force: bool) -> ClusterResult<()> {
    platform::kill_tree(pid, force).await
}

/// 进程及给定子孙是否全部退出
pub fn all_gone(pids: &[u32]) -> bool {
    pids.iter().all(|pid| !exists(*pid))
}

async fn run_quiet(command: &mut Command) -> ClusterResult<bool> {
    let output = command.output().await?;
    Ok(output.status.success())
}

#[cfg(target_os = "linux")]
mod platform {
    use super::*;
    use std::fs;

    /// 解析 /proc/<pid>/stat 中的状态与父进程号
    ///
    /// 进程名位于括号中且可能含有空格或括号，从最后一个 `)` 之后开始解析。
    pub(super) fn parse_stat(stat: &str) -> Option<(char, u32)> {
        let rest = &stat[stat.rfind(')')? + 1..];
        let mut fields = rest.split_whitespace();
        let state = fields.next()?.chars().next()?;
        let ppid = fields.next()?.parse().ok()?;
        Some((state, ppid))
    }

    fn read_stat(pid: u32) -> Option<(char, u32)> {
        let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        parse_stat(&stat)
    }

    pub fn exists(pid: u32) -> bool {
        matches!(read_stat(pid), Some((state, _)) if state != 'Z' && state != 'X')
    }

    pub fn children(pid: u32) -> Vec<u32> {
        let Ok(entries) = fs::read_dir("/proc") else {
            return Vec::new();
        };
        let mut result: Vec<u32> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
            .filter(|candidate| {
                matches!(read_stat(*candidate), Some((state, ppid)) if ppid == pid && state != 'Z')
            })
            .collect();
        result.sort_unstable();
        result
    }

    pub async fn kill_tree(pid: u32, force: bool) -> ClusterResult<()> {
        super::unix_kill_tree(pid, force).await
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
mod platform {
    use super::*;

    pub fn exists(pid: u32) -> bool {
        std::process::Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    pub fn children(pid: u32) -> Vec<u32> {
        std::process::Command::new("pgrep")
            .arg("-P")
            .arg(pid.to_string())
            .output()
            .map(|output| {
                String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .filter_map(|line| line.trim().parse().ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn kill_tree(pid: u32, force: bool) -> ClusterResult<()> {
        super::unix_kill_tree(pid, force).await
    }
}

#[cfg(unix)]
async fn unix_kill_tree(pid: u32, force: bool) -> ClusterResult<()> {
    let signal = if force { "-KILL" } else { "-TERM" };
    let mut targets = descendants(pid);
    targets.push(pid);
    debug!("终止进程 {} 的进程树: {:?} ({})", pid, targets, signal);

    let mut failed = Vec::new();
    for target in targets {
        let delivered = run_quiet(
            Command::new("sh")
                .arg("-c")
                .arg(format!("kill {signal} {target} 2>/dev/null")),
        )
        .await?;
        if !delivered && exists(target) {
            failed.push(target);
        }
    }

    if failed.is_empty() {
        Ok(())
    } else {
        warn!("向进程 {:?} 发送信号失败", failed);
        Err(ClusterError::TaskExecution(format!(
            "failed to signal processes {failed:?}"
        )))
    }
}

#[cfg(windows)]
mod platform {
    use super::*;

    pub fn exists(pid: u32) -> bool {
        std::process::Command::new("tasklist")
            .args(["/FI", &format!("PID eq {pid}"), "/NH"])
            .output()
            .map(|output| String::from_utf8_lossy(&output.stdout).contains(&pid.to_string()))
            .unwrap_or(false)
    }

    pub fn children(_pid: u32) -> Vec<u32> {
        // taskkill /T 自行处理子进程
        Vec::new()
    }

    pub async fn kill_tree(pid: u32, force: bool) -> ClusterResult<()> {
        let mut command = Command::new("taskkill");
        command.args(["/PID", &pid.to_string(), "/T"]);
        if force {
            command.arg("/F");
        }
        if run_quiet(&mut command).await? || !exists(pid) {
            Ok(())
        } else {
            warn!("taskkill 终止进程 {} 失败", pid);
            Err(ClusterError::TaskExecution(format!("taskkill failed for pid {pid}")))
        }
    }
}
