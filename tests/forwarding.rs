//! Forwarding engine tests against a mock stream opener.
//!
//! Logical streams are `tokio::io::duplex` pairs; the far end plays the
//! destination behind the SSH server.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sshtunnel::forward::{ForwardError, ForwardOptions, ForwardStats, Forwarder};
use sshtunnel::ssh::{parse_destination, LogicalStream, SshError, StreamOpener};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};
use tokio::{
    io::{self, AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
    time::{sleep, timeout, Duration},
};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy)]
enum Behaviour {
    /// 目标端回显
    Echo,
    /// 打开后目标端立即关闭
    CloseImmediately,
}

struct MockOpener {
    behaviour: Behaviour,
    refuse_first: AtomicUsize,
    opened: AtomicUsize,
    origins: Mutex<Vec<SocketAddr>>,
}

impl MockOpener {
    fn new(behaviour: Behaviour) -> Arc<Self> {
        Self::refusing(behaviour, 0)
    }

    fn refusing(behaviour: Behaviour, refuse_first: usize) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            refuse_first: AtomicUsize::new(refuse_first),
            opened: AtomicUsize::new(0),
            origins: Mutex::new(Vec::new()),
        })
    }

    fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamOpener for MockOpener {
    async fn open_stream(
        &self,
        destination: &str,
        origin: SocketAddr,
    ) -> Result<LogicalStream, SshError> {
        parse_destination(destination)?;
        if self
            .refuse_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SshError::Channel("administratively prohibited".into()));
        }

        self.opened.fetch_add(1, Ordering::SeqCst);
        self.origins.lock().unwrap().push(origin);

        let (near, far) = io::duplex(4096);
        match self.behaviour {
            Behaviour::Echo => {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = io::split(far);
                    let _ = io::copy(&mut reader, &mut writer).await;
                });
            }
            Behaviour::CloseImmediately => drop(far),
        }
        Ok(Box::new(near))
    }
}

struct Running {
    addr: SocketAddr,
    stats: Arc<ForwardStats>,
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), ForwardError>>,
}

async fn start(
    opener: Arc<MockOpener>,
    destination: &str,
    options: ForwardOptions,
) -> Result<Running> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let addr = listener.local_addr()?;
    let shutdown = CancellationToken::new();
    let forwarder = Forwarder::new(opener, destination, options);
    assert_eq!(forwarder.destination(), destination);
    let stats = forwarder.stats();
    let task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { forwarder.serve(listener, shutdown).await }
    });
    Ok(Running {
        addr,
        stats,
        shutdown,
        task,
    })
}

/// 等待活跃连接数归零
async fn wait_idle(stats: &ForwardStats) -> Result<()> {
    timeout(WAIT, async {
        while stats.active() != 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    Ok(())
}

async fn round_trip(stream: &mut TcpStream, payload: &[u8]) -> Result<Vec<u8>> {
    stream.write_all(payload).await?;
    let mut buf = vec![0u8; payload.len()];
    timeout(WAIT, stream.read_exact(&mut buf)).await??;
    Ok(buf)
}

/// 对端关闭：读到 EOF 或连接被重置
async fn assert_closed(stream: &mut TcpStream) -> Result<()> {
    let mut buf = [0u8; 16];
    match timeout(WAIT, stream.read(&mut buf)).await? {
        Ok(0) | Err(_) => Ok(()),
        Ok(n) => Err(anyhow!("expected closed socket, read {} bytes", n)),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn echo_round_trip_through_tunnel() -> Result<()> {
    let opener = MockOpener::new(Behaviour::Echo);
    let running = start(opener.clone(), "10.0.0.5:3389", ForwardOptions::default()).await?;

    let mut client = TcpStream::connect(running.addr).await?;
    assert_eq!(round_trip(&mut client, b"ping").await?, b"ping");

    assert_eq!(opener.opened(), 1);
    let origin = opener.origins.lock().unwrap()[0];
    assert_eq!(origin, client.local_addr()?);

    drop(client);
    running.shutdown.cancel();
    timeout(WAIT, running.task).await???;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refused_open_closes_only_that_connection() -> Result<()> {
    let opener = MockOpener::refusing(Behaviour::Echo, 1);
    let running = start(opener.clone(), "10.0.0.5:3389", ForwardOptions::default()).await?;

    let mut refused = TcpStream::connect(running.addr).await?;
    assert_closed(&mut refused).await?;

    let mut accepted = TcpStream::connect(running.addr).await?;
    assert_eq!(round_trip(&mut accepted, b"still here").await?, b"still here");
    assert!(!running.task.is_finished());

    drop(accepted);
    running.shutdown.cancel();
    timeout(WAIT, running.task).await???;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stats_track_active_and_failed_connections() -> Result<()> {
    let opener = MockOpener::refusing(Behaviour::Echo, 1);
    let running = start(opener, "10.0.0.5:3389", ForwardOptions::default()).await?;

    let mut refused = TcpStream::connect(running.addr).await?;
    assert_closed(&mut refused).await?;
    wait_idle(&running.stats).await?;

    let mut client = TcpStream::connect(running.addr).await?;
    assert_eq!(round_trip(&mut client, b"12345").await?, b"12345");
    assert_eq!(running.stats.active(), 1);

    drop(client);
    wait_idle(&running.stats).await?;

    let snapshot = running.stats.snapshot();
    assert_eq!(snapshot.connections_total, 2);
    assert_eq!(snapshot.open_failures, 1);
    assert_eq!(snapshot.bytes_sent, 5);
    assert_eq!(snapshot.bytes_received, 5);

    running.shutdown.cancel();
    timeout(WAIT, running.task).await???;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_destination_fails_per_connection() -> Result<()> {
    let opener = MockOpener::new(Behaviour::Echo);
    let running = start(opener.clone(), "", ForwardOptions::default()).await?;

    for _ in 0..2 {
        let mut client = TcpStream::connect(running.addr).await?;
        assert_closed(&mut client).await?;
    }
    assert_eq!(opener.opened(), 0);
    assert!(!running.task.is_finished());

    running.shutdown.cancel();
    timeout(WAIT, running.task).await???;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn destination_close_tears_down_local_socket() -> Result<()> {
    let opener = MockOpener::new(Behaviour::CloseImmediately);
    let running = start(opener, "10.0.0.5:3389", ForwardOptions::default()).await?;

    let mut client = TcpStream::connect(running.addr).await?;
    assert_closed(&mut client).await?;

    running.shutdown.cancel();
    timeout(WAIT, running.task).await???;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_streams_are_independent() -> Result<()> {
    let opener = MockOpener::new(Behaviour::Echo);
    let running = start(opener.clone(), "10.0.0.5:3389", ForwardOptions::default()).await?;

    let mut clients = Vec::new();
    for _ in 0..5 {
        clients.push(TcpStream::connect(running.addr).await?);
    }
    for (i, client) in clients.iter_mut().enumerate() {
        let payload = format!("client-{}", i);
        assert_eq!(round_trip(client, payload.as_bytes()).await?, payload.as_bytes());
    }

    drop(clients.remove(0));
    sleep(Duration::from_millis(50)).await;

    for (i, client) in clients.iter_mut().enumerate() {
        let payload = format!("again-{}", i);
        assert_eq!(round_trip(client, payload.as_bytes()).await?, payload.as_bytes());
    }
    assert_eq!(opener.opened(), 5);

    drop(clients);
    running.shutdown.cancel();
    timeout(WAIT, running.task).await???;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connection_limit_defers_extra_clients() -> Result<()> {
    let opener = MockOpener::new(Behaviour::Echo);
    let options = ForwardOptions {
        max_connections: Some(1),
        ..Default::default()
    };
    let running = start(opener.clone(), "10.0.0.5:3389", options).await?;

    let mut first = TcpStream::connect(running.addr).await?;
    assert_eq!(round_trip(&mut first, b"one").await?, b"one");

    let mut second = TcpStream::connect(running.addr).await?;
    second.write_all(b"two").await?;
    sleep(Duration::from_millis(200)).await;
    assert_eq!(opener.opened(), 1);

    drop(first);
    let mut buf = [0u8; 3];
    timeout(WAIT, second.read_exact(&mut buf)).await??;
    assert_eq!(&buf, b"two");
    assert_eq!(opener.opened(), 2);

    drop(second);
    running.shutdown.cancel();
    timeout(WAIT, running.task).await???;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_closes_listener_and_hard_closes_after_grace() -> Result<()> {
    let opener = MockOpener::new(Behaviour::Echo);
    let options = ForwardOptions {
        shutdown_grace: Duration::from_millis(200),
        ..Default::default()
    };
    let running = start(opener, "10.0.0.5:3389", options).await?;

    let mut client = TcpStream::connect(running.addr).await?;
    assert_eq!(round_trip(&mut client, b"busy").await?, b"busy");

    running.shutdown.cancel();
    timeout(WAIT, running.task).await???;

    assert_closed(&mut client).await?;
    assert!(TcpStream::connect(running.addr).await.is_err());
    Ok(())
}
