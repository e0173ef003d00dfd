// 后台进程生命周期
// start: fork + setsid，子进程通过管道回报启动状态
// stop: 读取 pid 文件，发送 SIGTERM，删除 pid / log 文件

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use nix::sys::signal::{kill, Signal};
use nix::sys::stat::{umask, Mode};
use nix::unistd::{dup2, fork, pipe, setsid, ForkResult, Pid};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::status::{ErrorKind, Response, StatusSink};

const PID_FILE_MODE: u32 = 0o644;
const LOG_FILE_MODE: u32 = 0o640;
const DAEMON_UMASK: u32 = 0o027;

/// 状态结束标记
const STATUS_TERMINATOR: &[u8] = b"\r\n\r\n";

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("pid file {path} not readable: {source}")]
    PidFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid pid {content:?} in {path}")]
    InvalidPid { path: PathBuf, content: String },

    #[error("Stop failed: {0}")]
    Signal(#[source] nix::Error),

    #[error("fork failed: {0}")]
    Fork(#[source] nix::Error),

    #[error("daemon setup failed: {0}")]
    Setup(#[source] nix::Error),

    #[error("daemon io error: {0}")]
    Io(#[from] io::Error),

    #[error("daemon exited without reporting status")]
    NoStatus,
}

/// 由监听地址派生的 pid / log 文件路径
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonPaths {
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
}

impl DaemonPaths {
    pub fn new(runtime_dir: &Path, addr: &str) -> Self {
        Self {
            pid_file: runtime_dir.join(format!("{}.pid", addr)),
            log_file: runtime_dir.join(format!("{}.log", addr)),
        }
    }

    pub fn read_pid(&self) -> Result<Pid, DaemonError> {
        let content = fs::read_to_string(&self.pid_file).map_err(|source| DaemonError::PidFile {
            path: self.pid_file.clone(),
            source,
        })?;
        // 0 与负数会作用于整个进程组
        match content.trim().parse::<i32>() {
            Ok(pid) if pid > 0 => Ok(Pid::from_raw(pid)),
            _ => Err(DaemonError::InvalidPid {
                path: self.pid_file.clone(),
                content,
            }),
        }
    }

    fn remove_files(&self) {
        for path in [&self.pid_file, &self.log_file] {
            match fs::remove_file(path) {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
    }
}

/// 停止后台进程
pub fn stop(paths: &DaemonPaths) -> Result<Pid, DaemonError> {
    stop_with(paths, |pid| kill(pid, Signal::SIGTERM))
}

/// 用给定的信号发送函数停止后台进程；发送失败时保留文件
pub fn stop_with<F>(paths: &DaemonPaths, send: F) -> Result<Pid, DaemonError>
where
    F: FnOnce(Pid) -> nix::Result<()>,
{
    let pid = paths.read_pid()?;
    send(pid).map_err(DaemonError::Signal)?;
    info!("Sent SIGTERM to {}", pid);
    paths.remove_files();
    Ok(pid)
}

/// 转入后台运行 `serve`
///
/// 必须在创建任何运行时线程之前调用。父进程等待子进程回报启动状态，
/// 原样打印到 stdout 后返回；子进程在 `serve` 结束后返回其退出码。
pub fn start<F>(paths: &DaemonPaths, serve: F) -> Result<ExitCode, DaemonError>
where
    F: FnOnce(StatusSink) -> ExitCode,
{
    let (read_end, write_end) = pipe().map_err(DaemonError::Setup)?;

    // SAFETY: 调用方保证此时进程只有一个线程
    match unsafe { fork() }.map_err(DaemonError::Fork)? {
        ForkResult::Parent { child } => {
            drop(write_end);
            debug!("Daemon forked as {}", child);

            let status = read_status(File::from(read_end))?;
            if status.is_empty() {
                return Err(DaemonError::NoStatus);
            }
            let mut stdout = io::stdout().lock();
            stdout.write_all(&status)?;
            stdout.flush()?;

            if status.starts_with(b"status:200") {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        ForkResult::Child => {
            drop(read_end);
            let mut sink = File::from(write_end);

            if let Err(e) = detach(paths) {
                let response = Response::error(ErrorKind::Listen, format!("daemon start err: {}", e));
                let _ = response.write_to(&mut sink);
                return Ok(ExitCode::FAILURE);
            }
            info!("Daemon started, pid {}", std::process::id());

            let code = serve(StatusSink::Pipe(sink));
            if let Err(e) = fs::remove_file(&paths.pid_file) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to remove {}: {}", paths.pid_file.display(), e);
                }
            }
            Ok(code)
        }
    }
}

/// 新会话、umask、标准输入输出重定向、写 pid 文件
fn detach(paths: &DaemonPaths) -> Result<(), DaemonError> {
    setsid().map_err(DaemonError::Setup)?;
    umask(Mode::from_bits_truncate(DAEMON_UMASK));

    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .mode(LOG_FILE_MODE)
        .open(&paths.log_file)?;
    let null = File::open("/dev/null")?;
    dup2(null.as_raw_fd(), 0).map_err(DaemonError::Setup)?;
    dup2(log.as_raw_fd(), 1).map_err(DaemonError::Setup)?;
    dup2(log.as_raw_fd(), 2).map_err(DaemonError::Setup)?;

    fs::write(&paths.pid_file, format!("{}", std::process::id()))?;
    fs::set_permissions(&paths.pid_file, fs::Permissions::from_mode(PID_FILE_MODE))?;
    Ok(())
}

/// 读取到结束标记或 EOF
fn read_status<R: Read>(mut reader: R) -> io::Result<Vec<u8>> {
    let mut status = Vec::new();
    let mut chunk = [0u8; 512];
    while !status.ends_with(STATUS_TERMINATOR) {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        status.extend_from_slice(&chunk[..n]);
    }
    Ok(status)
}
