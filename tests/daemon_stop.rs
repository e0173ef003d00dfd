//! Stop path against a real child process.
#![cfg(unix)]

use anyhow::Result;
use std::cell::Cell;
use std::fs;
use std::os::unix::process::ExitStatusExt;
use std::process::Command;
use std::time::{Duration, Instant};

use sshtunnel::cli::normalize_listen_addr;
use sshtunnel::daemon::{self, DaemonError, DaemonPaths};

fn paths_in(dir: &tempfile::TempDir, listen: &str) -> DaemonPaths {
    DaemonPaths::new(dir.path(), &normalize_listen_addr(listen))
}

#[test]
fn stop_terminates_process_and_removes_files() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let paths = paths_in(&dir, "4000");
    assert!(paths.pid_file.ends_with("127.0.0.1:4000.pid"));

    let mut child = Command::new("sleep").arg("30").spawn()?;
    fs::write(&paths.pid_file, child.id().to_string())?;
    fs::write(&paths.log_file, "started\n")?;

    let pid = daemon::stop(&paths)?;
    assert_eq!(pid.as_raw() as u32, child.id());

    let deadline = Instant::now() + Duration::from_secs(5);
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        assert!(Instant::now() < deadline, "child did not exit after SIGTERM");
        std::thread::sleep(Duration::from_millis(20));
    };
    assert_eq!(status.signal(), Some(libc_sigterm()));
    assert!(!paths.pid_file.exists());
    assert!(!paths.log_file.exists());
    Ok(())
}

#[test]
fn stop_signals_exactly_once() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let paths = paths_in(&dir, "127.0.0.1:4100");
    fs::write(&paths.pid_file, "31337")?;
    fs::write(&paths.log_file, "")?;

    let calls = Cell::new(0);
    let pid = daemon::stop_with(&paths, |pid| {
        calls.set(calls.get() + 1);
        assert_eq!(pid.as_raw(), 31337);
        Ok(())
    })?;

    assert_eq!(pid.as_raw(), 31337);
    assert_eq!(calls.get(), 1);
    assert!(!paths.pid_file.exists());
    assert!(!paths.log_file.exists());
    Ok(())
}

#[test]
fn stop_without_pid_file_fails() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let paths = paths_in(&dir, "4200");
    let err = daemon::stop(&paths).unwrap_err();
    assert!(matches!(err, DaemonError::PidFile { .. }));
    Ok(())
}

fn libc_sigterm() -> i32 {
    nix::sys::signal::Signal::SIGTERM as i32
}
