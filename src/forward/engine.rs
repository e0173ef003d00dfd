// 转发引擎
// 监听本地端口，为每个接入连接打开一条逻辑流并启动中继

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::relay::relay;
use super::stats::ForwardStats;
use crate::ssh::StreamOpener;

/// accept 暂时性错误的退避区间
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// 默认的关闭宽限期
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// 监听器级别的致命错误
#[derive(Debug, Error)]
pub enum ForwardError {
    /// 绑定监听地址失败
    #[error("listen addr {addr} err: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 不可恢复的 accept 错误
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
}

/// 转发选项
#[derive(Clone, Debug)]
pub struct ForwardOptions {
    /// 并发连接上限，None 表示不限
    pub max_connections: Option<usize>,
    /// 关闭时等待在途连接的时间
    pub shutdown_grace: Duration,
    /// 单方向读空闲超时，None 表示关闭
    pub idle_timeout: Option<Duration>,
    /// 接入连接是否设置 TCP_NODELAY
    pub tcp_nodelay: bool,
}

impl Default for ForwardOptions {
    fn default() -> Self {
        Self {
            max_connections: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            idle_timeout: None,
            tcp_nodelay: true,
        }
    }
}

/// accept 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptErrorClass {
    /// 记录后继续
    Transient,
    /// 停止服务
    Fatal,
}

/// 区分可恢复的 accept 错误（资源耗尽、被中断、对端提前断开）与监听器本身的故障
pub fn classify_accept_error(err: &io::Error) -> AcceptErrorClass {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut
        | io::ErrorKind::OutOfMemory => return AcceptErrorClass::Transient,
        _ => {}
    }

    #[cfg(unix)]
    if let Some(code) = err.raw_os_error() {
        use nix::errno::Errno;
        return match Errno::from_raw(code) {
            Errno::ECONNABORTED
            | Errno::ECONNRESET
            | Errno::EINTR
            | Errno::EAGAIN
            | Errno::ETIMEDOUT
            | Errno::EMFILE
            | Errno::ENFILE
            | Errno::ENOBUFS
            | Errno::ENOMEM
            | Errno::EPROTO
            | Errno::EPERM => AcceptErrorClass::Transient,
            _ => AcceptErrorClass::Fatal,
        };
    }

    AcceptErrorClass::Fatal
}

/// 绑定本地监听地址
pub async fn bind(addr: &str) -> Result<TcpListener, ForwardError> {
    TcpListener::bind(addr).await.map_err(|source| ForwardError::Bind {
        addr: addr.to_string(),
        source,
    })
}

/// 转发引擎
pub struct Forwarder {
    opener: Arc<dyn StreamOpener>,
    destination: Arc<str>,
    options: ForwardOptions,
    stats: Arc<ForwardStats>,
}

impl Forwarder {
    pub fn new(
        opener: Arc<dyn StreamOpener>,
        destination: impl Into<String>,
        options: ForwardOptions,
    ) -> Self {
        Self {
            opener,
            destination: Arc::from(destination.into()),
            options,
            stats: Arc::new(ForwardStats::new()),
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn stats(&self) -> Arc<ForwardStats> {
        self.stats.clone()
    }

    /// 绑定并服务
    pub async fn listen_and_serve(
        &self,
        addr: &str,
        shutdown: CancellationToken,
    ) -> Result<(), ForwardError> {
        let listener = bind(addr).await?;
        self.serve(listener, shutdown).await
    }

    /// 运行 accept 循环，直到 `shutdown` 被触发或监听器出现致命错误
    ///
    /// 返回前先关闭监听器，再等待在途连接最多 `shutdown_grace`，超时后强制关闭。
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), ForwardError> {
        match listener.local_addr() {
            Ok(addr) => info!("Forwarding {} -> {}", addr, self.destination),
            Err(_) => info!("Forwarding -> {}", self.destination),
        }

        let tracker = TaskTracker::new();
        let hard_stop = CancellationToken::new();
        let limiter = self
            .options
            .max_connections
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        let mut backoff = ACCEPT_BACKOFF_MIN;

        let result = loop {
            let permit = match &limiter {
                Some(limiter) => {
                    if limiter.available_permits() == 0 {
                        debug!("Connection limit reached, waiting for a slot");
                    }
                    tokio::select! {
                        _ = shutdown.cancelled() => break Ok(()),
                        permit = limiter.clone().acquire_owned() => match permit {
                            Ok(permit) => Some(permit),
                            Err(_) => break Ok(()),
                        },
                    }
                }
                None => None,
            };

            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        backoff = ACCEPT_BACKOFF_MIN;
                        self.spawn_worker(&tracker, stream, peer, permit, hard_stop.clone());
                    }
                    Err(e) => match classify_accept_error(&e) {
                        AcceptErrorClass::Transient => {
                            warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "Transient accept error");
                            tokio::select! {
                                _ = shutdown.cancelled() => break Ok(()),
                                _ = tokio::time::sleep(backoff) => {}
                            }
                            backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                        }
                        AcceptErrorClass::Fatal => {
                            error!(error = %e, "Listener failed");
                            break Err(ForwardError::Accept(e));
                        }
                    },
                },
            }
        };

        drop(listener);
        tracker.close();
        self.drain(&tracker, &hard_stop).await;

        let snapshot = self.stats.snapshot();
        info!(
            connections = snapshot.connections_total,
            open_failures = snapshot.open_failures,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            "Forwarder stopped"
        );
        result
    }

    async fn drain(&self, tracker: &TaskTracker, hard_stop: &CancellationToken) {
        if tracker.is_empty() {
            return;
        }

        info!(
            active = tracker.len(),
            grace_secs = self.options.shutdown_grace.as_secs(),
            "Draining in-flight connections"
        );
        if tokio::time::timeout(self.options.shutdown_grace, tracker.wait())
            .await
            .is_err()
        {
            warn!(active = tracker.len(), "Grace period elapsed, closing remaining connections");
            hard_stop.cancel();
            tracker.wait().await;
        }
    }

    fn spawn_worker(
        &self,
        tracker: &TaskTracker,
        stream: TcpStream,
        peer: SocketAddr,
        permit: Option<OwnedSemaphorePermit>,
        cancel: CancellationToken,
    ) {
        if self.options.tcp_nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(peer = %peer, "Failed to set TCP_NODELAY: {}", e);
            }
        }
        debug!(peer = %peer, "Accepted connection");

        let opener = self.opener.clone();
        let destination = self.destination.clone();
        let stats = self.stats.clone();
        let idle_timeout = self.options.idle_timeout;

        tracker.spawn(async move {
            let _permit = permit;
            handle_connection(opener, &destination, stream, peer, stats, idle_timeout, cancel)
                .await;
        });
    }
}

/// 单个接入连接：打开逻辑流，失败则只关闭本地连接
async fn handle_connection(
    opener: Arc<dyn StreamOpener>,
    destination: &str,
    stream: TcpStream,
    peer: SocketAddr,
    stats: Arc<ForwardStats>,
    idle_timeout: Option<Duration>,
    cancel: CancellationToken,
) {
    stats.connection_opened();

    let opened = tokio::select! {
        _ = cancel.cancelled() => None,
        opened = opener.open_stream(destination, peer) => Some(opened),
    };

    let outcome = match opened {
        None => {
            debug!(peer = %peer, "Connection cancelled before stream opened");
            None
        }
        Some(Err(e)) => {
            stats.open_failed();
            warn!(peer = %peer, destination = destination, error = %e, "Failed to open stream");
            None
        }
        Some(Ok(remote)) => Some(relay(stream, remote, stats.clone(), idle_timeout, cancel).await),
    };

    stats.connection_closed();
    if let Some(outcome) = outcome {
        debug!(
            peer = %peer,
            bytes_sent = outcome.bytes_sent,
            bytes_received = outcome.bytes_received,
            active = stats.active(),
            "Connection closed"
        );
    }
}
