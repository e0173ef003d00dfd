// known_hosts 校验
// 基于 russh::keys 的 known_hosts 解析，根据 HostKeyPolicy 给出结论

use std::path::Path;

use russh::keys::PublicKey;
use tracing::{info, warn};

use super::config::HostKeyPolicy;
use super::error::SshError;

/// 主机密钥校验结论
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostKeyVerdict {
    /// 与 known_hosts 记录一致
    Trusted,
    /// 首次连接，已写入 known_hosts
    Learned,
    /// 策略允许任意密钥
    Accepted,
    /// known_hosts 中没有该主机
    Unknown,
    /// 与 known_hosts 第 `line` 行的记录不一致（可能是中间人攻击）
    Changed { line: usize },
}

impl HostKeyVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(
            self,
            HostKeyVerdict::Trusted | HostKeyVerdict::Learned | HostKeyVerdict::Accepted
        )
    }
}

/// 按策略校验服务器公钥
pub fn verify_host_key(
    policy: &HostKeyPolicy,
    host: &str,
    port: u16,
    key: &PublicKey,
) -> Result<HostKeyVerdict, SshError> {
    match policy {
        HostKeyPolicy::AcceptAny => Ok(HostKeyVerdict::Accepted),
        HostKeyPolicy::Strict { known_hosts } => lookup(known_hosts, host, port, key),
        HostKeyPolicy::AcceptNew { known_hosts } => match lookup(known_hosts, host, port, key)? {
            HostKeyVerdict::Unknown => {
                // 父目录不存在时会一并创建
                russh::keys::known_hosts::learn_known_hosts_path(host, port, key, known_hosts)?;
                info!(
                    "Added {}:{} to {}",
                    host,
                    port,
                    known_hosts.display()
                );
                Ok(HostKeyVerdict::Learned)
            }
            verdict => Ok(verdict),
        },
    }
}

fn lookup(
    known_hosts: &Path,
    host: &str,
    port: u16,
    key: &PublicKey,
) -> Result<HostKeyVerdict, SshError> {
    if !known_hosts.exists() {
        return Ok(HostKeyVerdict::Unknown);
    }

    match russh::keys::check_known_hosts_path(host, port, key, known_hosts) {
        Ok(true) => Ok(HostKeyVerdict::Trusted),
        Ok(false) => Ok(HostKeyVerdict::Unknown),
        Err(russh::keys::Error::KeyChanged { line }) => {
            warn!(
                "Host key for {}:{} does not match {} line {}",
                host,
                port,
                known_hosts.display(),
                line
            );
            Ok(HostKeyVerdict::Changed { line })
        }
        Err(e) => Err(SshError::from(e)),
    }
}
