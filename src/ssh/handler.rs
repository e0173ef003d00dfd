// SSH 客户端 Handler 实现
// 实现 russh::client::Handler trait

use russh::keys::ssh_key::Fingerprint;
use russh::keys::PublicKey;
use std::future::Future;
use tracing::{debug, error, info, warn};

use super::config::HostKeyPolicy;
use super::known_hosts::{verify_host_key, HostKeyVerdict};

/// SSH 客户端 Handler
/// 握手阶段按 HostKeyPolicy 校验服务器公钥
pub struct SshClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl SshClientHandler {
    pub fn new(host: String, port: u16, policy: HostKeyPolicy) -> Self {
        Self { host, port, policy }
    }
}

impl russh::client::Handler for SshClientHandler {
    type Error = russh::Error;

    /// 检查服务器公钥
    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        let fingerprint = server_public_key.fingerprint(russh::keys::ssh_key::HashAlg::Sha256);
        debug!(
            "Server key: {} {}",
            server_public_key.algorithm(),
            fingerprint
        );

        let host = self.host.clone();
        let port = self.port;
        let policy = self.policy.clone();
        let key = server_public_key.clone();

        async move {
            // known_hosts 读写是阻塞 I/O
            let verdict = tokio::task::spawn_blocking({
                let host = host.clone();
                move || verify_host_key(&policy, &host, port, &key)
            })
            .await;

            let accepted = match verdict {
                Ok(Ok(verdict)) => accept_verdict(verdict, &host, port, &fingerprint),
                Ok(Err(e)) => {
                    error!("Host key verification failed: {}", e);
                    false
                }
                Err(e) => {
                    error!("Host key verification task failed: {}", e);
                    false
                }
            };
            Ok(accepted)
        }
    }
}

/// 记录校验结论，返回是否接受该公钥
fn accept_verdict(
    verdict: HostKeyVerdict,
    host: &str,
    port: u16,
    fingerprint: &Fingerprint,
) -> bool {
    match verdict {
        HostKeyVerdict::Accepted => warn!(
            "Host key verification disabled, accepting {} for {}:{}",
            fingerprint, host, port
        ),
        HostKeyVerdict::Learned => {
            info!("Trusting new host key {} for {}:{}", fingerprint, host, port)
        }
        HostKeyVerdict::Trusted => debug!("Host key for {}:{} matches known_hosts", host, port),
        HostKeyVerdict::Unknown => error!(
            "Host {}:{} is not in known_hosts (key {}); add it or choose another host key policy",
            host, port, fingerprint
        ),
        HostKeyVerdict::Changed { line } => error!(
            "HOST KEY CHANGED for {}:{} (now {}, known_hosts line {})",
            host, port, fingerprint, line
        ),
    }
    verdict.is_allowed()
}
