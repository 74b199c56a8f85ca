use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::NodeConfig;
use crate::{ClusterError, ClusterResult};

/// 节点身份
///
/// 首次启动时生成并写入本地磁盘，之后每次启动重新加载。`key` 一旦生成
/// 就不再改变；其余字段以配置为准，加载时会被配置覆盖并回写。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeIdentity {
    pub key: String,
    pub name: String,
    pub is_master: bool,
    pub max_runners: i32,
    pub auth_key: String,
}

impl NodeIdentity {
    /// 加载节点身份，文件不存在时创建
    pub fn load_or_create(path: &Path, config: &NodeConfig) -> ClusterResult<Self> {
        let mut identity = if path.exists() {
            Self::read(path)?
        } else {
            let identity = Self {
                key: uuid::Uuid::new_v4().to_string(),
                name: default_node_name(),
                is_master: config.is_master,
                max_runners: config.max_runners,
                auth_key: config.auth_key.clone(),
            };
            info!("生成新的节点身份 {}，保存到 {}", identity.key, path.display());
            identity
        };

        identity.apply_config(config);
        identity.save(path)?;
        Ok(identity)
    }

    /// 从磁盘重新读取
    pub fn reload(&mut self, path: &Path) -> ClusterResult<()> {
        let stored = Self::read(path)?;
        if stored.key != self.key {
            return Err(ClusterError::Configuration(format!(
                "node key changed on disk: {} -> {}",
                self.key, stored.key
            )));
        }
        *self = stored;
        Ok(())
    }

    pub fn save(&self, path: &Path) -> ClusterResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    fn read(path: &Path) -> ClusterResult<Self> {
        let bytes = std::fs::read(path)?;
        let identity: Self = serde_json::from_slice(&bytes)?;
        if identity.key.is_empty() {
            return Err(ClusterError::Configuration(format!(
                "node identity at {} has an empty key",
                path.display()
            )));
        }
        Ok(identity)
    }

    fn apply_config(&mut self, config: &NodeConfig) {
        if let Some(name) = &config.name {
            self.name = name.clone();
        }
        self.is_master = config.is_master;
        self.max_runners = config.max_runners;
        self.auth_key = config.auth_key.clone();
    }
}

/// 展开路径开头的 `~`
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

fn default_node_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "node".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_config() -> NodeConfig {
        NodeConfig {
            identity_path: String::new(),
            name: None,
            is_master: false,
            max_runners: 3,
            auth_key: "secret".to_string(),
        }
    }

    #[test]
    fn test_identity_created_then_reloaded_with_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("node.json");

        let first = NodeIdentity::load_or_create(&path, &node_config()).unwrap();
        assert!(path.exists());
        assert_eq!(first.max_runners, 3);
        assert!(!first.is_master);

        let mut config = node_config();
        config.name = Some("crawler-01".to_string());
        config.max_runners = 6;
        let second = NodeIdentity::load_or_create(&path, &config).unwrap();

        assert_eq!(second.key, first.key);
        assert_eq!(second.name, "crawler-01");
        assert_eq!(second.max_runners, 6);
    }

    #[test]
    fn test_reload_picks_up_changes_and_rejects_new_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        let mut identity = NodeIdentity::load_or_create(&path, &node_config()).unwrap();

        let mut edited = identity.clone();
        edited.max_runners = 10;
        edited.save(&path).unwrap();
        identity.reload(&path).unwrap();
        assert_eq!(identity.max_runners, 10);

        edited.key = "another".to_string();
        edited.save(&path).unwrap();
        assert!(identity.reload(&path).is_err());
    }

    #[test]
    fn test_corrupt_identity_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(&path, b"{not json").unwrap();

        assert!(NodeIdentity::load_or_create(&path, &node_config()).is_err());
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/etc/node.json"), PathBuf::from("/etc/node.json"));
        if let Some(home) = std::env::var_os("HOME") {
            assert_eq!(
                expand_home("~/.cluster/node.json"),
                PathBuf::from(home).join(".cluster/node.json")
            );
        }
    }
}
