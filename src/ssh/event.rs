// SSH 隧道建立阶段

use std::fmt;

/// 连接阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionStage {
    /// 初始化（解析地址）
    Initializing = 0,
    /// 连接代理（如果配置了代理）
    ConnectingProxy = 1,
    /// TCP 连接 SSH 服务器
    ConnectingHost = 2,
    /// SSH 握手（密钥交换、主机密钥校验）
    Handshaking = 3,
    /// 身份认证
    Authenticating = 4,
    /// 隧道就绪
    Connected = 5,
}

impl ConnectionStage {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Initializing => "initialization",
            Self::ConnectingProxy => "proxy connect",
            Self::ConnectingHost => "TCP connect",
            Self::Handshaking => "SSH handshake",
            Self::Authenticating => "authentication",
            Self::Connected => "connected",
        }
    }
}

impl fmt::Display for ConnectionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
