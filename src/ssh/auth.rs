// 认证方式链构建
//
// 把原始凭据（密码、私钥、口令、外部签名器、交互应答器）转换为
// 按顺序提供给服务器的认证方式列表。

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use russh::keys::PrivateKey;
use tracing::{debug, warn};

/// 键盘交互认证中服务器提出的单个问题
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Challenge {
    /// 提示文本
    pub prompt: String,
    /// 是否回显输入
    pub echo: bool,
}

impl From<&russh::client::Prompt> for Challenge {
    fn from(prompt: &russh::client::Prompt) -> Self {
        Self {
            prompt: prompt.prompt.clone(),
            echo: prompt.echo,
        }
    }
}

/// 键盘交互认证应答器
///
/// 每轮收到服务器的问题列表后返回同样数量的答案。
pub trait KeyboardResponder: Send + Sync {
    fn respond(&self, name: &str, instructions: &str, challenges: &[Challenge]) -> Vec<String>;
}

/// 默认应答器：所有问题都用密码回答
///
/// 覆盖只开放 keyboard-interactive 的服务器。
#[derive(Clone, Default)]
pub struct PasswordResponder {
    password: String,
}

impl PasswordResponder {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

impl KeyboardResponder for PasswordResponder {
    fn respond(&self, _name: &str, _instructions: &str, challenges: &[Challenge]) -> Vec<String> {
        vec![self.password.clone(); challenges.len()]
    }
}

impl fmt::Debug for PasswordResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordResponder").finish_non_exhaustive()
    }
}

/// 外部签名器：不暴露私钥本身的签名能力
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExternalSigner {
    /// ssh-agent（Unix socket 路径）
    Agent { socket: PathBuf },
}

impl ExternalSigner {
    /// 从 SSH_AUTH_SOCK 获取 agent
    pub fn agent_from_env() -> Option<Self> {
        std::env::var_os("SSH_AUTH_SOCK")
            .filter(|s| !s.is_empty())
            .map(|socket| ExternalSigner::Agent {
                socket: PathBuf::from(socket),
            })
    }
}

/// 公钥认证使用的签名来源
#[derive(Clone)]
pub enum KeySigner {
    /// 已解析的私钥
    Key(Arc<PrivateKey>),
    /// 外部签名器
    External(ExternalSigner),
}

impl fmt::Debug for KeySigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySigner::Key(key) => f
                .debug_tuple("Key")
                .field(&key.algorithm().as_str())
                .finish(),
            KeySigner::External(signer) => f.debug_tuple("External").field(signer).finish(),
        }
    }
}

/// 单个认证方式
#[derive(Clone)]
pub enum AuthMethod {
    /// 密码认证
    Password(String),
    /// 键盘交互认证
    KeyboardInteractive(Arc<dyn KeyboardResponder>),
    /// 公钥认证
    PublicKey(KeySigner),
}

impl AuthMethod {
    pub fn label(&self) -> &'static str {
        match self {
            AuthMethod::Password(_) => "password",
            AuthMethod::KeyboardInteractive(_) => "keyboard-interactive",
            AuthMethod::PublicKey(KeySigner::Key(_)) => "publickey",
            AuthMethod::PublicKey(KeySigner::External(_)) => "publickey-agent",
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Password(_) => f.write_str("Password(..)"),
            AuthMethod::KeyboardInteractive(_) => f.write_str("KeyboardInteractive(..)"),
            AuthMethod::PublicKey(signer) => f.debug_tuple("PublicKey").field(signer).finish(),
        }
    }
}

/// 原始凭据集合，进程启动时构建一次
#[derive(Clone, Default)]
pub struct CredentialSet {
    pub password: Option<String>,
    pub private_key: Option<Vec<u8>>,
    pub passphrase: Option<String>,
    pub external_signer: Option<ExternalSigner>,
    pub interactive_responder: Option<Arc<dyn KeyboardResponder>>,
}

impl CredentialSet {
    fn password(&self) -> &str {
        self.password.as_deref().unwrap_or_default()
    }

    fn passphrase(&self) -> Option<&str> {
        self.passphrase.as_deref().filter(|p| !p.is_empty())
    }

    fn private_key(&self) -> Option<&[u8]> {
        self.private_key.as_deref().filter(|k| !k.is_empty())
    }
}

impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSet")
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("private_key", &self.private_key.as_ref().map(|k| k.len()))
            .field("passphrase", &self.passphrase.as_ref().map(|_| "***"))
            .field("external_signer", &self.external_signer)
            .field(
                "interactive_responder",
                &self.interactive_responder.is_some(),
            )
            .finish()
    }
}

/// 私钥两次解析都失败时留下的诊断信息
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyDiagnostic {
    /// 使用口令解析时的错误（未尝试则为 None）
    pub with_passphrase: Option<String>,
    /// 不带口令解析时的错误
    pub without_passphrase: String,
}

impl fmt::Display for KeyDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.with_passphrase {
            Some(e) => write!(
                f,
                "private key ignored: with passphrase: {}; without passphrase: {}",
                e, self.without_passphrase
            ),
            None => write!(f, "private key ignored: {}", self.without_passphrase),
        }
    }
}

/// 有序认证方式链
#[derive(Clone, Debug, Default)]
pub struct AuthMethodChain {
    methods: Vec<AuthMethod>,
    diagnostics: Vec<KeyDiagnostic>,
}

impl AuthMethodChain {
    /// 按固定顺序构建：密码 → 键盘交互 → 私钥 → 外部签名器
    ///
    /// 私钥先用口令解析，失败（或未提供口令）再不带口令解析；
    /// 两次都失败则跳过该私钥并记录诊断，不会让整个构建失败。
    pub fn resolve(credentials: &CredentialSet) -> Self {
        let mut chain = Self::default();

        if !credentials.password().is_empty() {
            chain
                .methods
                .push(AuthMethod::Password(credentials.password().to_string()));
        }

        let responder = credentials
            .interactive_responder
            .clone()
            .unwrap_or_else(|| Arc::new(PasswordResponder::new(credentials.password())));
        chain.methods.push(AuthMethod::KeyboardInteractive(responder));

        if let Some(material) = credentials.private_key() {
            match parse_private_key(material, credentials.passphrase()) {
                Ok(key) => chain
                    .methods
                    .push(AuthMethod::PublicKey(KeySigner::Key(Arc::new(key)))),
                Err(diagnostic) => {
                    warn!(%diagnostic, "Skipping unusable private key");
                    chain.diagnostics.push(diagnostic);
                }
            }
        }

        if let Some(signer) = &credentials.external_signer {
            chain
                .methods
                .push(AuthMethod::PublicKey(KeySigner::External(signer.clone())));
        }

        debug!(methods = ?chain.labels(), "Resolved authentication chain");
        chain
    }

    pub fn methods(&self) -> &[AuthMethod] {
        &self.methods
    }

    pub fn iter(&self) -> impl Iterator<Item = &AuthMethod> {
        self.methods.iter()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn labels(&self) -> Vec<&'static str> {
        self.methods.iter().map(AuthMethod::label).collect()
    }

    /// 被丢弃私钥的诊断
    pub fn diagnostics(&self) -> &[KeyDiagnostic] {
        &self.diagnostics
    }
}

fn parse_private_key(material: &[u8], passphrase: Option<&str>) -> Result<PrivateKey, KeyDiagnostic> {
    let text = std::str::from_utf8(material).map_err(|e| KeyDiagnostic {
        with_passphrase: None,
        without_passphrase: format!("key material is not valid UTF-8: {}", e),
    })?;

    let with_passphrase = match passphrase {
        Some(pass) => match russh::keys::decode_secret_key(text, Some(pass)) {
            Ok(key) => return Ok(key),
            Err(e) => Some(e.to_string()),
        },
        None => None,
    };

    // 口令错误时仍尝试按未加密私钥解析
    russh::keys::decode_secret_key(text, None).map_err(|e| KeyDiagnostic {
        with_passphrase,
        without_passphrase: e.to_string(),
    })
}
