// 转发统计

use std::sync::atomic::{AtomicU64, Ordering};

/// 转发计数器，所有连接任务共享
#[derive(Debug, Default)]
pub struct ForwardStats {
    connections_total: AtomicU64,
    active_connections: AtomicU64,
    open_failures: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

/// 某一时刻的统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// 累计接受的连接数
    pub connections_total: u64,
    /// 当前活跃连接数
    pub active_connections: u64,
    /// 逻辑流打开失败次数
    pub open_failures: u64,
    /// 本地 → 远端字节数
    pub bytes_sent: u64,
    /// 远端 → 本地字节数
    pub bytes_received: u64,
}

impl ForwardStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// 新连接被接受
    pub fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// 连接结束（无论成功与否）
    pub fn connection_closed(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
    }

    pub fn open_failed(&self) {
        self.open_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_received(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn active(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            open_failures: self.open_failures.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}
