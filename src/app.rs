// 组装：凭据 → SSH 会话 → 本地监听 → 转发
// 所有异步工作运行在同一个多线程运行时中

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cli::Cli;
use crate::forward::{self, ForwardOptions, Forwarder};
use crate::settings::Settings;
use crate::ssh::auth::{AuthMethodChain, CredentialSet};
use crate::ssh::{HostKeyPolicy, SshClient, SshConfig, TunnelSession};
use crate::status::{ErrorKind, Response, StatusSink};

/// 一次隧道运行所需的全部输入，均已解码
#[derive(Debug, Clone)]
pub struct TunnelJob {
    pub listen_addr: String,
    pub destination: String,
    pub ssh: SshConfig,
    pub credentials: CredentialSet,
    pub options: ForwardOptions,
}

impl TunnelJob {
    /// 解码失败时给出 ErrParams 状态
    pub fn from_cli(cli: &Cli, settings: &Settings) -> Result<Self, Response> {
        let credentials = cli.credentials().map_err(|e| {
            error!("{}", e);
            Response::error(ErrorKind::Params, e.to_string())
        })?;
        let ssh = cli.ssh_config(&settings.connection).map_err(|e| {
            error!("{}", e);
            Response::error(ErrorKind::Params, e.to_string())
        })?;

        Ok(Self {
            listen_addr: cli.listen_addr(),
            destination: cli.remote_addr.clone(),
            ssh,
            credentials,
            options: cli.forward_options(&settings.forwarding),
        })
    }
}

/// 前台或后台子进程的入口：构建运行时并阻塞直到隧道结束
pub fn run(cli: &Cli, settings: &Settings, sink: StatusSink) -> ExitCode {
    let job = match TunnelJob::from_cli(cli, settings) {
        Ok(job) => job,
        Err(response) => {
            sink.report(&response);
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("tunnel-worker")
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create Tokio runtime: {}", e);
            sink.report(&Response::error(
                ErrorKind::Gateway,
                format!("runtime init err: {}", e),
            ));
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(run_tunnel(job, sink))
}

/// 建立会话、绑定监听并转发，直到收到终止信号、会话断开或监听器失败
pub async fn run_tunnel(job: TunnelJob, sink: StatusSink) -> ExitCode {
    if job.ssh.host_key_policy == HostKeyPolicy::AcceptAny {
        warn!("Host key verification is disabled (host key policy: accept-any)");
    }

    let chain = AuthMethodChain::resolve(&job.credentials);
    let client = SshClient::new(job.ssh, chain);
    let session = match client.connect().await {
        Ok(session) => Arc::new(session),
        Err(e) => {
            if e.is_auth() {
                error!("SSH authentication failed: {}", e);
            } else {
                error!("SSH connection failed: {}", e);
            }
            sink.report(&Response::error(ErrorKind::Gateway, e.to_string()));
            return ExitCode::FAILURE;
        }
    };

    let listener = match forward::bind(&job.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("{}", e);
            sink.report(&Response::error(ErrorKind::Listen, e.to_string()));
            close_session(&session).await;
            return ExitCode::FAILURE;
        }
    };
    let bound = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            let message = format!("listen addr {} err: {}", job.listen_addr, e);
            error!("{}", message);
            sink.report(&Response::error(ErrorKind::Listen, message));
            close_session(&session).await;
            return ExitCode::FAILURE;
        }
    };
    sink.report(&Response::success(bound));
    let forwarder = Forwarder::new(session.clone(), job.destination, job.options);
    info!(
        "Listening on {}, forwarding to {} via {}@{}",
        bound,
        forwarder.destination(),
        session.username(),
        session.server()
    );

    let shutdown = CancellationToken::new();
    let session_lost = Arc::new(AtomicBool::new(false));

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            tokio::select! {
                _ = wait_for_signal() => shutdown.cancel(),
                _ = shutdown.cancelled() => {}
            }
        }
    });

    tokio::spawn({
        let shutdown = shutdown.clone();
        let session = session.clone();
        let session_lost = session_lost.clone();
        async move {
            tokio::select! {
                _ = session.closed() => {
                    error!("SSH session to {} lost", session.server());
                    session_lost.store(true, Ordering::SeqCst);
                    shutdown.cancel();
                }
                _ = shutdown.cancelled() => {}
            }
        }
    });

    let result = forwarder.serve(listener, shutdown.clone()).await;
    shutdown.cancel();
    close_session(&session).await;

    match result {
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
        Ok(()) if session_lost.load(Ordering::SeqCst) => ExitCode::FAILURE,
        Ok(()) => {
            info!("Tunnel stopped");
            ExitCode::SUCCESS
        }
    }
}

async fn close_session(session: &TunnelSession) {
    if !session.is_alive() {
        return;
    }
    if let Err(e) = session.close().await {
        warn!("Failed to close SSH session: {}", e);
    }
}

/// SIGTERM（stop 命令）或 Ctrl-C
#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = terminate.recv() => info!("Received SIGTERM, shutting down"),
                _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
            }
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            info!("Received SIGINT, shutting down");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl-C, shutting down");
}
