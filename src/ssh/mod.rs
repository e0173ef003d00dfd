// SSH 连接模块
//
// 模块结构:
// - auth: 凭据与认证方式链 (CredentialSet, AuthMethodChain)
// - config: 连接配置 (SshConfig, HostKeyPolicy, ProxyConfig)
// - error: 错误类型 (SshError)
// - event: 连接阶段 (ConnectionStage)
// - handler: russh Handler 实现
// - known_hosts: 主机密钥校验
// - proxy: HTTP / SOCKS5 代理
// - client: SSH 客户端核心
// - session: 隧道会话与逻辑流 (TunnelSession, StreamOpener)

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod handler;
pub mod known_hosts;
pub mod proxy;
pub mod session;

// 公开导出
pub use auth::{
    AuthMethod, AuthMethodChain, Challenge, CredentialSet, ExternalSigner, KeyboardResponder,
    PasswordResponder,
};
pub use client::SshClient;
pub use config::{HostKeyPolicy, KeepaliveConfig, ProxyConfig, ProxyType, SshConfig};
pub use error::SshError;
pub use event::ConnectionStage;
pub use session::{parse_destination, LogicalStream, StreamOpener, TunnelSession};
