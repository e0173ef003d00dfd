// 一次性状态协议
// 启动结果以若干 `key:value` 行写到 stdout，以空行结束

use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::net::SocketAddr;

use tracing::warn;

pub const SUCCESS_STATUS: u16 = 200;
pub const BAD_STATUS: u16 = 400;

const LINE_SEPARATOR: &str = "\r\n";
const MSG_OK: &str = "ok";

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 参数解码失败（base64、密钥文件）
    Params,
    /// SSH 拨号或认证失败
    Gateway,
    /// 本地监听失败
    Listen,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Params => "ErrParams",
            ErrorKind::Gateway => "ErrGateway",
            ErrorKind::Listen => "ErrListen",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 状态响应
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub error: Option<ErrorKind>,
    pub message: String,
}

impl Response {
    /// 监听已就绪
    pub fn success(addr: SocketAddr) -> Self {
        Self {
            status: SUCCESS_STATUS,
            host: Some(addr.ip().to_string()),
            port: Some(addr.port()),
            error: None,
            message: MSG_OK.to_string(),
        }
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status: BAD_STATUS,
            host: None,
            port: None,
            error: Some(kind),
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == SUCCESS_STATUS
    }

    /// 写出并刷新
    pub fn write_to<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(self.to_string().as_bytes())?;
        writer.flush()
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status:{}{}", self.status, LINE_SEPARATOR)?;
        if let Some(host) = self.host.as_deref().filter(|h| !h.is_empty()) {
            write!(f, "host:{}{}", host, LINE_SEPARATOR)?;
        }
        if let Some(port) = self.port.filter(|p| *p != 0) {
            write!(f, "port:{}{}", port, LINE_SEPARATOR)?;
        }
        if let Some(kind) = self.error {
            write!(f, "error:{}{}", kind, LINE_SEPARATOR)?;
        }
        write!(f, "message:{}{}", self.message, LINE_SEPARATOR)?;
        f.write_str(LINE_SEPARATOR)
    }
}

/// 启动状态的去向
#[derive(Debug)]
pub enum StatusSink {
    /// 前台运行，直接写 stdout
    Stdout,
    /// 后台子进程，经管道写回父进程
    Pipe(File),
}

impl StatusSink {
    /// 写出唯一一次状态
    pub fn report(self, response: &Response) {
        let result = match self {
            StatusSink::Stdout => response.write_to(io::stdout().lock()),
            StatusSink::Pipe(mut file) => response.write_to(&mut file),
        };
        if let Err(e) = result {
            warn!("Failed to report status: {}", e);
        }
    }
}
