// sshtunnel - 经由单个 SSH 会话的本地端口转发

pub mod app;
pub mod cli;
#[cfg(unix)]
pub mod daemon;
pub mod forward;
pub mod settings;
pub mod ssh;
pub mod status;
