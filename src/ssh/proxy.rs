// 代理连接模块
// SSH 服务器的 TCP 连接可经由 HTTP CONNECT 或 SOCKS5 代理建立

use std::fmt::Display;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use async_http_proxy::{http_connect_tokio, http_connect_tokio_with_basic_auth};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;

use super::config::{ProxyConfig, ProxyType};
use super::error::SshError;

/// 通过代理连接到目标主机
pub async fn connect_via_proxy(
    proxy: &ProxyConfig,
    target_host: &str,
    target_port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, SshError> {
    let hop = ProxyHop {
        proxy,
        limit: connect_timeout,
    };
    let proxy_addr = hop.resolve().await?;
    debug!(
        proxy = %proxy_addr,
        kind = hop.kind(),
        target_host,
        target_port,
        "Dialing through proxy"
    );

    match proxy.proxy_type {
        ProxyType::Socks5 => hop.socks5(proxy_addr, target_host, target_port).await,
        ProxyType::Http => hop.http_connect(proxy_addr, target_host, target_port).await,
    }
}

/// 一次代理跳转；每一步都受同一个超时约束
struct ProxyHop<'a> {
    proxy: &'a ProxyConfig,
    limit: Duration,
}

impl ProxyHop<'_> {
    fn kind(&self) -> &'static str {
        match self.proxy.proxy_type {
            ProxyType::Socks5 => "SOCKS5",
            ProxyType::Http => "HTTP",
        }
    }

    /// 限时执行一步，超时与失败都归为 SshError::Proxy
    async fn step<T, E, F>(&self, what: &str, fut: F) -> Result<T, SshError>
    where
        F: Future<Output = Result<T, E>>,
        E: Display,
    {
        match timeout(self.limit, fut).await {
            Err(_) => Err(SshError::Proxy(format!(
                "{} proxy {} timed out after {:?}",
                self.kind(),
                what,
                self.limit
            ))),
            Ok(Err(e)) => Err(self.failure(what, &e.to_string())),
            Ok(Ok(value)) => Ok(value),
        }
    }

    fn failure(&self, what: &str, reason: &str) -> SshError {
        let rejected_auth = match self.proxy.proxy_type {
            ProxyType::Socks5 => reason.contains("auth"),
            ProxyType::Http => reason.contains("407"),
        };
        if rejected_auth {
            SshError::Proxy(format!("{} proxy authentication failed: {}", self.kind(), reason))
        } else {
            SshError::Proxy(format!("{} proxy {} failed: {}", self.kind(), what, reason))
        }
    }

    async fn resolve(&self) -> Result<SocketAddr, SshError> {
        let mut addrs = self
            .step(
                "lookup",
                tokio::net::lookup_host((self.proxy.host.as_str(), self.proxy.port)),
            )
            .await?;
        addrs.next().ok_or_else(|| {
            SshError::Proxy(format!(
                "{}:{} resolved to no address",
                self.proxy.host, self.proxy.port
            ))
        })
    }

    async fn socks5(
        &self,
        proxy_addr: SocketAddr,
        host: &str,
        port: u16,
    ) -> Result<TcpStream, SshError> {
        let target = (host, port);
        let stream = match &self.proxy.auth {
            Some((username, password)) => {
                self.step(
                    "connect",
                    Socks5Stream::connect_with_password(proxy_addr, target, username, password),
                )
                .await?
            }
            None => {
                self.step("connect", Socks5Stream::connect(proxy_addr, target))
                    .await?
            }
        };
        Ok(stream.into_inner())
    }

    async fn http_connect(
        &self,
        proxy_addr: SocketAddr,
        host: &str,
        port: u16,
    ) -> Result<TcpStream, SshError> {
        let mut stream = self.step("connect", TcpStream::connect(proxy_addr)).await?;
        match &self.proxy.auth {
            Some((username, password)) => {
                self.step(
                    "CONNECT",
                    http_connect_tokio_with_basic_auth(&mut stream, host, port, username, password),
                )
                .await?
            }
            None => {
                self.step("CONNECT", http_connect_tokio(&mut stream, host, port))
                    .await?
            }
        }
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn proxy_at(proxy_type: ProxyType, addr: SocketAddr) -> ProxyConfig {
        ProxyConfig {
            proxy_type,
            host: addr.ip().to_string(),
            port: addr.port(),
            auth: None,
        }
    }

    #[tokio::test]
    async fn test_http_connect_tunnel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut byte = [0u8; 1];
            while !request.ends_with(b"\r\n\r\n") {
                socket.read_exact(&mut byte).await.unwrap();
                request.push(byte[0]);
            }
            socket
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            let mut payload = [0u8; 4];
            socket.read_exact(&mut payload).await.unwrap();
            socket.write_all(&payload).await.unwrap();
            String::from_utf8(request).unwrap()
        });

        let mut stream = connect_via_proxy(&proxy_at(ProxyType::Http, addr), "ssh.internal", 22, TIMEOUT)
            .await
            .unwrap();
        stream.write_all(b"SSH-").await.unwrap();
        let mut echoed = [0u8; 4];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"SSH-");

        let request = server.await.unwrap();
        assert!(request.starts_with("CONNECT ssh.internal:22 "));
    }

    #[tokio::test]
    async fn test_socks5_tunnel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 2];
            socket.read_exact(&mut greeting).await.unwrap();
            let mut methods = vec![0u8; greeting[1] as usize];
            socket.read_exact(&mut methods).await.unwrap();
            socket.write_all(&[0x05, 0x00]).await.unwrap();

            let mut header = [0u8; 4];
            socket.read_exact(&mut header).await.unwrap();
            let host = match header[3] {
                0x03 => {
                    let mut len = [0u8; 1];
                    socket.read_exact(&mut len).await.unwrap();
                    let mut name = vec![0u8; len[0] as usize];
                    socket.read_exact(&mut name).await.unwrap();
                    String::from_utf8(name).unwrap()
                }
                0x01 => {
                    let mut ip = [0u8; 4];
                    socket.read_exact(&mut ip).await.unwrap();
                    std::net::Ipv4Addr::from(ip).to_string()
                }
                other => panic!("unexpected address type {}", other),
            };
            let mut port = [0u8; 2];
            socket.read_exact(&mut port).await.unwrap();
            socket
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
            (host, u16::from_be_bytes(port))
        });

        connect_via_proxy(&proxy_at(ProxyType::Socks5, addr), "ssh.internal", 2222, TIMEOUT)
            .await
            .unwrap();

        let (host, port) = server.await.unwrap();
        assert_eq!(host, "ssh.internal");
        assert_eq!(port, 2222);
    }

    #[tokio::test]
    async fn test_unreachable_proxy_is_proxy_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = connect_via_proxy(&proxy_at(ProxyType::Http, addr), "ssh.internal", 22, TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, SshError::Proxy(_)));
    }

    #[tokio::test]
    async fn test_http_407_is_auth_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let mut proxy = proxy_at(ProxyType::Http, addr);
        proxy.auth = Some(("alice".into(), "wrong".into()));
        let err = connect_via_proxy(&proxy, "ssh.internal", 22, TIMEOUT)
            .await
            .unwrap_err();
        match err {
            SshError::Proxy(message) => {
                assert!(message.starts_with("HTTP proxy authentication failed"), "{}", message)
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_silent_proxy_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(socket);
        });

        let err = connect_via_proxy(
            &proxy_at(ProxyType::Socks5, addr),
            "ssh.internal",
            22,
            Duration::from_millis(200),
        )
        .await
        .unwrap_err();
        match err {
            SshError::Proxy(message) => {
                assert_eq!(message, "SOCKS5 proxy connect timed out after 200ms")
            }
            other => panic!("unexpected error {:?}", other),
        }
        server.abort();
    }
}
