// 可选的 JSON 设置文件
// Linux: ~/.config/sshtunnel/settings.json

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub connection: ConnectionSettings,
    pub forwarding: ForwardingSettings,
}

// ======================== 连接设置 ========================

/// 主机密钥校验模式
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyMode {
    #[default]
    Strict,
    AcceptNew,
    AcceptAny,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionSettings {
    pub connect_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
    pub keepalive_max: usize,
    pub host_key_policy: HostKeyMode,
    /// 为空时使用 ~/.ssh/known_hosts
    pub known_hosts_path: Option<PathBuf>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 300,
            keepalive_interval_secs: 30,
            keepalive_max: 3,
            host_key_policy: HostKeyMode::Strict,
            known_hosts_path: None,
        }
    }
}

// ======================== 转发设置 ========================

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ForwardingSettings {
    pub max_connections: Option<usize>,
    pub shutdown_grace_secs: u64,
    /// 0 表示关闭
    pub idle_timeout_secs: u64,
    pub tcp_nodelay: bool,
}

impl Default for ForwardingSettings {
    fn default() -> Self {
        Self {
            max_connections: None,
            shutdown_grace_secs: 10,
            idle_timeout_secs: 0,
            tcp_nodelay: true,
        }
    }
}

/// 默认设置文件路径
pub fn default_settings_file() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("sshtunnel").join("settings.json"))
}

/// 加载设置；未指定路径且默认文件不存在时返回默认值
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => match default_settings_file() {
            Some(path) if path.exists() => path,
            _ => return Ok(Settings::default()),
        },
    };

    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read settings file {}", path.display()))?;
    let settings: Settings = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse settings file {}", path.display()))?;
    Ok(settings)
}
