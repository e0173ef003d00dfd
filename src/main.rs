// sshtunnel
// 应用入口

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sshtunnel::app;
use sshtunnel::cli::{Cli, LogFormat, Signal};
use sshtunnel::settings::load_settings;
use sshtunnel::status::{ErrorKind, Response, StatusSink};

/// 日志写到 stderr，stdout 只输出状态
/// 可以通过 RUST_LOG 环境变量控制日志级别，例如：RUST_LOG=debug
fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Console => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    match cli.signal {
        Signal::Stop => stop(&cli),
        Signal::Start => start(&cli),
    }
}

fn start(cli: &Cli) -> ExitCode {
    let settings = match load_settings(cli.settings.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            error!("{:#}", e);
            StatusSink::Stdout.report(&Response::error(ErrorKind::Params, format!("{:#}", e)));
            return ExitCode::FAILURE;
        }
    };

    if !cli.daemon {
        return app::run(cli, &settings, StatusSink::Stdout);
    }

    #[cfg(unix)]
    {
        use sshtunnel::daemon::{self, DaemonPaths};

        let paths = DaemonPaths::new(&cli.runtime_dir, &cli.listen_addr());
        match daemon::start(&paths, |sink| app::run(cli, &settings, sink)) {
            Ok(code) => code,
            Err(e) => {
                error!("run failed: {}", e);
                ExitCode::FAILURE
            }
        }
    }

    #[cfg(not(unix))]
    {
        error!("Daemon mode is only supported on Unix");
        ExitCode::FAILURE
    }
}

#[cfg(unix)]
fn stop(cli: &Cli) -> ExitCode {
    use sshtunnel::daemon::{self, DaemonPaths};

    let paths = DaemonPaths::new(&cli.runtime_dir, &cli.listen_addr());
    match daemon::stop(&paths) {
        Ok(pid) => {
            info!("Stopped tunnel {} (pid {})", cli.listen_addr(), pid);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(not(unix))]
fn stop(_cli: &Cli) -> ExitCode {
    error!("Stop is only supported on Unix");
    ExitCode::FAILURE
}
