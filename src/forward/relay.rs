// 连接中继
// 本地连接与逻辑流之间的双向字节拷贝，任一方向结束即关闭两端

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::stats::ForwardStats;

/// 单次读取缓冲区大小
const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// 半关闭通知的最长等待时间
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// 拷贝方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// 本地 → 远端
    Outbound,
    /// 远端 → 本地
    Inbound,
}

impl Direction {
    fn label(&self) -> &'static str {
        match self {
            Direction::Outbound => "local->remote",
            Direction::Inbound => "remote->local",
        }
    }
}

/// 一对连接的中继结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayOutcome {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// 对端正常断开产生的错误，不值得告警
pub fn is_benign(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}

/// 在两端之间中继，直到任一方向结束或 `cancel` 被触发
///
/// 两个方向各自在独立任务中运行。任一方向遇到 EOF 或错误时，
/// 取消这一对连接，另一方向随即退出，两端的所有权在此被释放。
pub async fn relay<L, R>(
    local: L,
    remote: R,
    stats: Arc<ForwardStats>,
    idle_timeout: Option<Duration>,
    cancel: CancellationToken,
) -> RelayOutcome
where
    L: AsyncRead + AsyncWrite + Send + 'static,
    R: AsyncRead + AsyncWrite + Send + 'static,
{
    let pair = cancel.child_token();
    let (local_read, local_write) = tokio::io::split(local);
    let (remote_read, remote_write) = tokio::io::split(remote);

    let outbound = tokio::spawn(pump(
        local_read,
        remote_write,
        Direction::Outbound,
        stats.clone(),
        idle_timeout,
        pair.clone(),
    ));
    let inbound = tokio::spawn(pump(
        remote_read,
        local_write,
        Direction::Inbound,
        stats,
        idle_timeout,
        pair.clone(),
    ));

    let (sent, received) = tokio::join!(outbound, inbound);
    RelayOutcome {
        bytes_sent: sent.unwrap_or_default(),
        bytes_received: received.unwrap_or_default(),
    }
}

async fn pump<Rd, Wr>(
    mut reader: Rd,
    mut writer: Wr,
    direction: Direction,
    stats: Arc<ForwardStats>,
    idle_timeout: Option<Duration>,
    pair: CancellationToken,
) -> u64
where
    Rd: AsyncRead + Unpin,
    Wr: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;

    let result: io::Result<bool> = loop {
        let n = tokio::select! {
            _ = pair.cancelled() => break Ok(false),
            read = read_with_idle(&mut reader, &mut buf, idle_timeout) => match read {
                Ok(n) => n,
                Err(e) => break Err(e),
            },
        };
        if n == 0 {
            break Ok(true);
        }

        tokio::select! {
            _ = pair.cancelled() => break Ok(false),
            written = writer.write_all(&buf[..n]) => {
                if let Err(e) = written {
                    break Err(e);
                }
            }
        }

        total += n as u64;
        match direction {
            Direction::Outbound => stats.add_sent(n),
            Direction::Inbound => stats.add_received(n),
        }
    };

    match result {
        Ok(true) => {
            debug!(direction = direction.label(), bytes = total, "Reached end of stream");
            let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, writer.shutdown()).await;
        }
        Ok(false) => {}
        Err(e) if is_benign(&e) => {
            debug!(direction = direction.label(), error = %e, "Relay closed by peer");
        }
        Err(e) => {
            warn!(direction = direction.label(), error = %e, "Relay error");
        }
    }

    pair.cancel();
    total
}

async fn read_with_idle<Rd>(
    reader: &mut Rd,
    buf: &mut [u8],
    idle_timeout: Option<Duration>,
) -> io::Result<usize>
where
    Rd: AsyncRead + Unpin,
{
    match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, reader.read(buf))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("idle for {}s", limit.as_secs()),
                )
            })?,
        None => reader.read(buf).await,
    }
}
