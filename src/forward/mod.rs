// 本地端口转发
//
// - engine: accept 循环、并发上限、关闭宽限 (Forwarder)
// - relay: 单连接双向中继
// - stats: 转发计数器

pub mod engine;
pub mod relay;
pub mod stats;

pub use engine::{
    bind, classify_accept_error, AcceptErrorClass, ForwardError, ForwardOptions, Forwarder,
};
pub use relay::{relay, RelayOutcome};
pub use stats::{ForwardStats, StatsSnapshot};
