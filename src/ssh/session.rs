// SSH 隧道会话
// 认证成功后的单一多路复用连接，可并发打开任意数量的 direct-tcpip 逻辑流

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::Handle;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::error::SshError;
use super::handler::SshClientHandler;

/// 逻辑流需要满足的 IO 能力
pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> TunnelIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// 经隧道到达目标地址的一条双向字节流
pub type LogicalStream = Box<dyn TunnelIo>;

/// 打开逻辑流的能力
///
/// 实现必须可被多个连接任务同时调用，调用方不做额外加锁。
#[async_trait]
pub trait StreamOpener: Send + Sync {
    /// 打开到 `destination`（`host:port`）的新逻辑流，`origin` 为本地对端地址
    async fn open_stream(
        &self,
        destination: &str,
        origin: SocketAddr,
    ) -> Result<LogicalStream, SshError>;
}

/// 解析 `host:port` / `[v6]:port`
pub fn parse_destination(destination: &str) -> Result<(String, u16), SshError> {
    let destination = destination.trim();
    if destination.is_empty() {
        return Err(SshError::Config("Destination address is empty".to_string()));
    }

    let (host, port) = destination.rsplit_once(':').ok_or_else(|| {
        SshError::Config(format!("Destination {} has no port", destination))
    })?;

    let host = match host.strip_prefix('[') {
        Some(inner) => inner.strip_suffix(']').ok_or_else(|| {
            SshError::Config(format!("Malformed destination {}", destination))
        })?,
        None if host.contains(':') => {
            return Err(SshError::Config(format!(
                "IPv6 destination must be bracketed: {}",
                destination
            )))
        }
        None => host,
    };
    if host.is_empty() {
        return Err(SshError::Config(format!(
            "Destination {} has no host",
            destination
        )));
    }

    let port = port
        .parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| SshError::Config(format!("Invalid port in destination {}", destination)))?;

    Ok((host.to_string(), port))
}

/// SSH 隧道会话
/// 内部持有 Handle，Handle 的通道操作只需 &self，可直接跨任务共享
pub struct TunnelSession {
    /// 共享的 russh Handle
    handle: Arc<Handle<SshClientHandler>>,
    /// 服务器地址（host:port）
    server: String,
    /// 用户名
    username: String,
    /// 是否已主动关闭
    closed: AtomicBool,
}

impl TunnelSession {
    pub fn new(handle: Handle<SshClientHandler>, server: String, username: String) -> Self {
        Self {
            handle: Arc::new(handle),
            server,
            username,
            closed: AtomicBool::new(false),
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// 检查会话是否活跃
    pub fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::Relaxed) && !self.handle.is_closed()
    }

    /// 等待底层传输断开
    pub async fn closed(&self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        while self.is_alive() {
            ticker.tick().await;
        }
    }

    /// 打开 direct-tcpip 通道
    pub async fn open_channel(
        &self,
        destination: &str,
        origin: SocketAddr,
    ) -> Result<russh::ChannelStream<russh::client::Msg>, SshError> {
        if !self.is_alive() {
            return Err(SshError::Disconnected(
                "Session is disconnected".to_string(),
            ));
        }

        let (host, port) = parse_destination(destination)?;
        let channel = self
            .handle
            .channel_open_direct_tcpip(
                host,
                port as u32,
                origin.ip().to_string(),
                origin.port() as u32,
            )
            .await
            .map_err(|e| SshError::Channel(format!("direct-tcpip to {} failed: {}", destination, e)))?;

        debug!("Opened channel {} to {}", channel.id(), destination);
        Ok(channel.into_stream())
    }

    /// 关闭会话
    pub async fn close(&self) -> Result<(), SshError> {
        self.closed.store(true, Ordering::Relaxed);
        self.handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
            .map_err(SshError::from)
    }
}

#[async_trait]
impl StreamOpener for TunnelSession {
    async fn open_stream(
        &self,
        destination: &str,
        origin: SocketAddr,
    ) -> Result<LogicalStream, SshError> {
        let stream = self.open_channel(destination, origin).await?;
        Ok(Box::new(stream))
    }
}
