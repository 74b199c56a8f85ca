use serde::{Deserialize, Serialize};

/// 本地节点配置
///
/// 这些值在加载节点身份文件时覆盖文件中的对应字段，`key` 除外。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// 节点身份文件路径，`~` 会展开为用户主目录
    pub identity_path: String,
    pub name: Option<String>,
    pub is_master: bool,
    pub max_runners: i32,
    /// 控制平面共享密钥
    pub auth_key: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            identity_path: "~/.cluster/node.json".to_string(),
            name: None,
            is_master: false,
            max_runners: 8,
            auth_key: "cluster-auth-key".to_string(),
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.identity_path.is_empty() {
            return Err(anyhow::anyhow!("节点身份文件路径不能为空"));
        }

        if self.max_runners <= 0 {
            return Err(anyhow::anyhow!("最大执行器数量必须大于0"));
        }

        if self.auth_key.is_empty() {
            return Err(anyhow::anyhow!("控制平面密钥不能为空"));
        }

        Ok(())
    }
}

/// 控制平面服务端/客户端地址
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 主节点监听地址
    pub bind_address: String,
    /// 所有节点（包括主节点自身）访问控制平面的地址
    pub master_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8000".to_string(),
            master_address: "http://127.0.0.1:8000".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(anyhow::anyhow!("无效的监听地址: {}", self.bind_address));
        }

        if !self.master_address.starts_with("http://")
            && !self.master_address.starts_with("https://")
        {
            return Err(anyhow::anyhow!(
                "主节点地址必须以 http:// 或 https:// 开头: {}",
                self.master_address
            ));
        }

        Ok(())
    }
}
