// 命令行参数
// 参数解码（base64 密码、私钥文件）与监听地址规范化

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::{Parser, ValueEnum};
use thiserror::Error;

use crate::forward::ForwardOptions;
use crate::settings::{ConnectionSettings, ForwardingSettings, HostKeyMode};
use crate::ssh::auth::{CredentialSet, ExternalSigner};
use crate::ssh::config::{default_known_hosts_path, HostKeyPolicy, KeepaliveConfig, ProxyConfig, SshConfig};
use crate::ssh::SshError;

/// 启动 / 停止
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Signal {
    #[default]
    Start,
    Stop,
}

/// 日志输出格式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// 人类可读
    #[default]
    Console,
    /// JSON（结构化日志）
    Json,
}

/// 凭据解码错误
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Decode password error {0}")]
    PasswordBase64(#[source] base64::DecodeError),

    #[error("Decode password error {0}")]
    PasswordEncoding(#[source] std::string::FromUtf8Error),

    #[error("Decode private key error {0}")]
    KeyBase64(#[source] base64::DecodeError),

    #[error("Read private key err {0}")]
    KeyFile(#[source] io::Error),
}

/// Forward a local TCP port to a remote address through one SSH session
#[derive(Parser, Debug, Clone)]
#[command(name = "sshtunnel")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// start | stop
    #[arg(short = 's', long, value_enum, default_value = "start")]
    pub signal: Signal,

    /// Run in the background
    #[arg(short = 'd', long)]
    pub daemon: bool,

    /// Listen address (host:port, or a bare port bound on 127.0.0.1)
    #[arg(long, default_value = "")]
    pub listen: String,

    /// SSH server host
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// SSH server port
    #[arg(long, default_value_t = 22)]
    pub port: u16,

    /// SSH username
    #[arg(long, default_value = "root")]
    pub username: String,

    /// SSH password
    #[arg(long, env = "SSHTUNNEL_PASSWORD", default_value = "", hide_env_values = true)]
    pub password: String,

    /// Password is base64 encoded
    #[arg(long)]
    pub b64: bool,

    /// SSH private key path
    #[arg(long, alias = "privateKey")]
    pub private_key: Option<PathBuf>,

    /// SSH private key as a base64 string
    #[arg(long, alias = "privateKey_b64")]
    pub private_key_b64: Option<String>,

    /// Private key passphrase (defaults to the password)
    #[arg(long)]
    pub passphrase: Option<String>,

    /// Also authenticate with keys held by the agent at SSH_AUTH_SOCK
    #[arg(long)]
    pub agent: bool,

    /// Address the SSH server connects to on our behalf
    #[arg(long, alias = "remoteAddr", default_value = "1.1.1.1:3389")]
    pub remote_addr: String,

    /// Reach the SSH server through socks5://[user:pass@]host:port or http://[user:pass@]host:port
    #[arg(long)]
    pub proxy: Option<String>,

    /// Host key verification policy
    #[arg(long, value_enum)]
    pub host_key_policy: Option<HostKeyMode>,

    /// known_hosts file (default: ~/.ssh/known_hosts)
    #[arg(long)]
    pub known_hosts: Option<PathBuf>,

    /// Timeout in seconds for each of dial, handshake and authentication
    #[arg(long)]
    pub connect_timeout: Option<u64>,

    /// Maximum concurrent forwarded connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Settings file (default: <config dir>/sshtunnel/settings.json)
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Directory for daemon pid and log files
    #[arg(long, default_value = "/tmp")]
    pub runtime_dir: PathBuf,

    /// Log output format
    #[arg(long, value_enum, default_value = "console", env = "SSHTUNNEL_LOG_FORMAT")]
    pub log_format: LogFormat,
}

/// 规范化监听地址：含 `:` 原样使用，纯端口绑定到 127.0.0.1，空值为 0.0.0.0:0
pub fn normalize_listen_addr(listen: &str) -> String {
    let listen = listen.trim();
    if listen.is_empty() {
        "0.0.0.0:0".to_string()
    } else if listen.contains(':') {
        listen.to_string()
    } else {
        format!("127.0.0.1:{}", listen)
    }
}

impl Cli {
    pub fn listen_addr(&self) -> String {
        normalize_listen_addr(&self.listen)
    }

    /// 解码凭据，在任何网络操作之前完成
    pub fn credentials(&self) -> Result<CredentialSet, CredentialError> {
        let password = if self.b64 {
            let bytes = STANDARD
                .decode(self.password.trim())
                .map_err(CredentialError::PasswordBase64)?;
            String::from_utf8(bytes).map_err(CredentialError::PasswordEncoding)?
        } else {
            self.password.clone()
        };

        // 私钥文件优先于 base64 私钥
        let private_key = match (&self.private_key, &self.private_key_b64) {
            (Some(path), _) => Some(std::fs::read(path).map_err(CredentialError::KeyFile)?),
            (None, Some(encoded)) if !encoded.is_empty() => Some(
                STANDARD
                    .decode(encoded.trim())
                    .map_err(CredentialError::KeyBase64)?,
            ),
            (None, _) => None,
        };

        // 提供了私钥但未给口令时，用密码作为口令
        let passphrase = match (&private_key, &self.passphrase) {
            (Some(_), Some(passphrase)) => Some(passphrase.clone()),
            (Some(_), None) => Some(password.clone()).filter(|p| !p.is_empty()),
            (None, _) => None,
        };

        let external_signer = if self.agent {
            ExternalSigner::agent_from_env()
        } else {
            None
        };

        Ok(CredentialSet {
            password: Some(password).filter(|p| !p.is_empty()),
            private_key,
            passphrase,
            external_signer,
            interactive_responder: None,
        })
    }

    /// 命令行参数覆盖设置文件
    pub fn ssh_config(&self, settings: &ConnectionSettings) -> Result<SshConfig, SshError> {
        let proxy = self
            .proxy
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(ProxyConfig::parse)
            .transpose()?;

        let known_hosts = self
            .known_hosts
            .clone()
            .or_else(|| settings.known_hosts_path.clone())
            .unwrap_or_else(default_known_hosts_path);
        let host_key_policy = match self.host_key_policy.unwrap_or(settings.host_key_policy) {
            HostKeyMode::Strict => HostKeyPolicy::Strict { known_hosts },
            HostKeyMode::AcceptNew => HostKeyPolicy::AcceptNew { known_hosts },
            HostKeyMode::AcceptAny => HostKeyPolicy::AcceptAny,
        };

        let keepalive = KeepaliveConfig {
            enabled: settings.keepalive_interval_secs > 0,
            interval: Duration::from_secs(settings.keepalive_interval_secs),
            max_retries: settings.keepalive_max,
        };

        Ok(SshConfig {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            connect_timeout: Duration::from_secs(
                self.connect_timeout.unwrap_or(settings.connect_timeout_secs),
            ),
            proxy,
            keepalive,
            host_key_policy,
        })
    }

    pub fn forward_options(&self, settings: &ForwardingSettings) -> ForwardOptions {
        ForwardOptions {
            max_connections: self.max_connections.or(settings.max_connections),
            shutdown_grace: Duration::from_secs(settings.shutdown_grace_secs),
            idle_timeout: Some(settings.idle_timeout_secs)
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            tcp_nodelay: settings.tcp_nodelay,
        }
    }
}
