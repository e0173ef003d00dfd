// SSH 错误类型定义

use thiserror::Error;

use super::event::ConnectionStage;

/// SSH 错误类型
#[derive(Debug, Error)]
pub enum SshError {
    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO 错误（网络连接等）
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 认证失败
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// SSH 协议错误
    #[error("SSH protocol error: {0}")]
    Protocol(String),

    /// 密钥错误
    #[error("Key error: {0}")]
    Key(String),

    /// 代理错误
    #[error("Proxy error: {0}")]
    Proxy(String),

    /// 主机密钥校验失败
    #[error("Host key rejected: {0}")]
    HostKey(String),

    /// 连接超时
    #[error("Connection timeout during {0} after {1}s")]
    Timeout(ConnectionStage, u64),

    /// 通道错误
    #[error("Channel error: {0}")]
    Channel(String),

    /// 会话已断开
    #[error("Session disconnected: {0}")]
    Disconnected(String),
}

impl SshError {
    /// 是否为认证阶段的失败（仅用于日志区分）
    pub fn is_auth(&self) -> bool {
        matches!(self, SshError::Auth(_) | SshError::Key(_))
    }
}

impl From<russh::Error> for SshError {
    fn from(e: russh::Error) -> Self {
        match e {
            russh::Error::UnknownKey => {
                SshError::HostKey("server host key did not pass verification".to_string())
            }
            other => SshError::Protocol(other.to_string()),
        }
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(e: russh::keys::Error) -> Self {
        SshError::Key(e.to_string())
    }
}
