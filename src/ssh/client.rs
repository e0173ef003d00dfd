// SSH 客户端核心实现

use std::future::Future;
use std::sync::Arc;

use russh::client::{Handle, KeyboardInteractiveAuthResponse};
use russh::keys::{HashAlg, PrivateKeyWithHashAlg};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::auth::{AuthMethod, AuthMethodChain, Challenge, ExternalSigner, KeySigner};
use super::config::SshConfig;
use super::error::SshError;
use super::event::ConnectionStage;
use super::handler::SshClientHandler;
use super::proxy::connect_via_proxy;
use super::session::TunnelSession;

/// 键盘交互最多往返轮数
const MAX_INTERACTIVE_ROUNDS: usize = 8;

/// SSH 客户端
/// 负责建立 SSH 连接并返回 TunnelSession
pub struct SshClient {
    /// 连接配置
    config: SshConfig,
    /// 认证方式链
    chain: AuthMethodChain,
}

impl SshClient {
    pub fn new(config: SshConfig, chain: AuthMethodChain) -> Self {
        Self { config, chain }
    }

    /// 在阶段超时内执行
    async fn within<T, F>(&self, stage: ConnectionStage, fut: F) -> Result<T, SshError>
    where
        F: Future<Output = Result<T, SshError>>,
    {
        debug!("Stage: {}", stage);
        timeout(self.config.connect_timeout, fut)
            .await
            .map_err(|_| SshError::Timeout(stage, self.config.connect_timeout.as_secs()))?
    }

    /// 建立隧道会话：TCP 连接 → 握手 → 按顺序尝试认证方式
    pub async fn connect(&self) -> Result<TunnelSession, SshError> {
        let server = self.config.address();
        debug!("Stage: {}", ConnectionStage::Initializing);
        info!(
            "Connecting to {}@{}",
            self.config.username, server
        );

        let tcp_stream = match &self.config.proxy {
            Some(proxy) => {
                debug!("Stage: {}", ConnectionStage::ConnectingProxy);
                info!("Connecting via {:?} proxy {}:{}", proxy.proxy_type, proxy.host, proxy.port);
                connect_via_proxy(
                    proxy,
                    &self.config.host,
                    self.config.port,
                    self.config.connect_timeout,
                )
                .await?
            }
            None => {
                self.within(ConnectionStage::ConnectingHost, async {
                    TcpStream::connect((self.config.host.as_str(), self.config.port))
                        .await
                        .map_err(SshError::Io)
                })
                .await?
            }
        };

        if let Err(e) = tcp_stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on SSH socket: {}", e);
        }

        let handler = SshClientHandler::new(
            self.config.host.clone(),
            self.config.port,
            self.config.host_key_policy.clone(),
        );
        let russh_config = Arc::new(self.config.to_russh_config());

        let mut handle = self
            .within(ConnectionStage::Handshaking, async {
                russh::client::connect_stream(russh_config, tcp_stream, handler)
                    .await
                    .map_err(SshError::from)
            })
            .await?;

        self.within(ConnectionStage::Authenticating, self.authenticate(&mut handle))
            .await?;

        debug!("Stage: {}", ConnectionStage::Connected);
        info!(
            "Tunnel session established to {} as '{}'",
            server, self.config.username
        );
        Ok(TunnelSession::new(
            handle,
            server,
            self.config.username.clone(),
        ))
    }

    /// 依次尝试链中的认证方式，第一个成功即返回
    async fn authenticate(&self, handle: &mut Handle<SshClientHandler>) -> Result<(), SshError> {
        if self.chain.is_empty() {
            return Err(SshError::Auth(
                "No authentication methods configured".to_string(),
            ));
        }

        let rsa_hint = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();

        for method in self.chain.iter() {
            let label = method.label();
            debug!(method = label, "Trying authentication method");
            match self.try_method(handle, method, rsa_hint).await {
                Ok(true) => {
                    info!(method = label, "Authentication succeeded");
                    return Ok(());
                }
                Ok(false) => warn!(method = label, "Authentication rejected by server"),
                Err(e) => warn!(method = label, error = %e, "Authentication attempt failed"),
            }
        }

        let mut reason = format!(
            "all methods rejected ({})",
            self.chain.labels().join(", ")
        );
        for diagnostic in self.chain.diagnostics() {
            reason.push_str("; ");
            reason.push_str(&diagnostic.to_string());
        }
        Err(SshError::Auth(reason))
    }

    async fn try_method(
        &self,
        handle: &mut Handle<SshClientHandler>,
        method: &AuthMethod,
        rsa_hint: Option<HashAlg>,
    ) -> Result<bool, SshError> {
        let username = self.config.username.as_str();
        match method {
            AuthMethod::Password(password) => {
                let result = handle
                    .authenticate_password(username, password.as_str())
                    .await?;
                Ok(result.success())
            }
            AuthMethod::KeyboardInteractive(responder) => {
                let mut response = handle
                    .authenticate_keyboard_interactive_start(username, None::<String>)
                    .await?;

                for _ in 0..MAX_INTERACTIVE_ROUNDS {
                    match response {
                        KeyboardInteractiveAuthResponse::Success => return Ok(true),
                        KeyboardInteractiveAuthResponse::Failure { .. } => return Ok(false),
                        KeyboardInteractiveAuthResponse::InfoRequest {
                            name,
                            instructions,
                            prompts,
                        } => {
                            let challenges: Vec<Challenge> =
                                prompts.iter().map(Challenge::from).collect();
                            debug!(prompts = challenges.len(), "Keyboard-interactive round");
                            let answers = responder.respond(&name, &instructions, &challenges);
                            response = handle
                                .authenticate_keyboard_interactive_respond(answers)
                                .await?;
                        }
                    }
                }
                Err(SshError::Auth(
                    "Too many keyboard-interactive rounds".to_string(),
                ))
            }
            AuthMethod::PublicKey(KeySigner::Key(key)) => {
                let hash_alg = if key.algorithm().is_rsa() { rsa_hint } else { None };
                let result = handle
                    .authenticate_publickey(
                        username,
                        PrivateKeyWithHashAlg::new(key.clone(), hash_alg),
                    )
                    .await?;
                Ok(result.success())
            }
            AuthMethod::PublicKey(KeySigner::External(signer)) => {
                authenticate_external(handle, username, signer, rsa_hint).await
            }
        }
    }
}

/// AgentClient 的 Signer 包装
/// 先克隆公钥再进入 async 块，保证 authenticate_publickey_with 的 future 为 Send
#[cfg(unix)]
struct AgentSigner<'a> {
    agent: &'a mut russh::keys::agent::client::AgentClient<
        Box<dyn russh::keys::agent::client::AgentStream + Send + Unpin + 'static>,
    >,
}

#[cfg(unix)]
impl russh::Signer for AgentSigner<'_> {
    type Error = russh::AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        key: &russh::keys::PublicKey,
        hash_alg: Option<HashAlg>,
        to_sign: russh::CryptoVec,
    ) -> impl Future<Output = Result<russh::CryptoVec, Self::Error>> + Send {
        let key_owned = key.clone();
        async move {
            self.agent
                .sign_request(&key_owned, hash_alg, to_sign)
                .await
                .map_err(Into::into)
        }
    }
}

#[cfg(unix)]
async fn authenticate_external(
    handle: &mut Handle<SshClientHandler>,
    username: &str,
    signer: &ExternalSigner,
    rsa_hint: Option<HashAlg>,
) -> Result<bool, SshError> {
    use russh::keys::agent::client::AgentClient;

    let ExternalSigner::Agent { socket } = signer;
    let mut agent = AgentClient::connect_uds(socket)
        .await
        .map_err(|e| SshError::Auth(format!("Failed to connect to SSH agent: {}", e)))?
        .dynamic();
    let identities = agent
        .request_identities()
        .await
        .map_err(|e| SshError::Auth(format!("Failed to list agent keys: {}", e)))?;

    debug!(count = identities.len(), "Trying agent identities");
    for key in identities {
        let hash_alg = if key.algorithm().is_rsa() { rsa_hint } else { None };
        match handle
            .authenticate_publickey_with(
                username,
                key.clone(),
                hash_alg,
                &mut AgentSigner { agent: &mut agent },
            )
            .await
        {
            Ok(result) if result.success() => return Ok(true),
            Ok(_) => debug!("Agent key rejected: {}", key.comment()),
            Err(e) => warn!("Agent signing error for key {}: {}", key.comment(), e),
        }
    }
    Ok(false)
}

#[cfg(not(unix))]
async fn authenticate_external(
    _handle: &mut Handle<SshClientHandler>,
    _username: &str,
    _signer: &ExternalSigner,
    _rsa_hint: Option<HashAlg>,
) -> Result<bool, SshError> {
    Err(SshError::Auth(
        "SSH agent is not supported on this platform".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::ssh::auth::CredentialSet;
    use crate::ssh::config::HostKeyPolicy;
    use tokio::net::TcpListener;

    fn client(port: u16, connect_timeout: Duration) -> SshClient {
        let config = SshConfig {
            host: "127.0.0.1".to_string(),
            port,
            connect_timeout,
            host_key_policy: HostKeyPolicy::AcceptAny,
            ..Default::default()
        };
        SshClient::new(
            config,
            AuthMethodChain::resolve(&CredentialSet {
                password: Some("pw".to_string()),
                ..Default::default()
            }),
        )
    }

    #[tokio::test]
    async fn test_refused_dial_is_io_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = client(port, Duration::from_secs(5)).connect().await.err().unwrap();
        assert!(matches!(err, SshError::Io(_)), "unexpected {:?}", err);
    }

    #[tokio::test]
    async fn test_silent_server_times_out_in_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // 接受连接但从不发送 SSH banner
        let _server = tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                if let Ok((socket, _)) = listener.accept().await {
                    held.push(socket);
                }
            }
        });

        let err = client(port, Duration::from_millis(300))
            .connect()
            .await
            .err()
            .unwrap();
        assert!(
            matches!(err, SshError::Timeout(ConnectionStage::Handshaking, _)),
            "unexpected {:?}",
            err
        );
    }
}
