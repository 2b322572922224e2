use crate::flow::Transport;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::time::timeout;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("Connection to {target} failed: {source}")]
    ConnectionFailed {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection to {target} timed out after {timeout:?}")]
    Timeout { target: String, timeout: Duration },

    #[error("Target {0} did not resolve to any address")]
    Unresolved(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

enum Writer {
    Tcp(OwnedWriteHalf),
    Udp(Arc<UdpSocket>),
}

/// Read side of an upstream connection, consumed by its drainer.
pub enum UpstreamReader {
    Tcp(OwnedReadHalf),
    Udp(Arc<UdpSocket>),
}

impl UpstreamReader {
    /// Returns `None` once a stream transport reports end of stream.
    /// Datagram transports never do; an empty datagram reads as `Some(0)`.
    pub async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<Option<usize>> {
        match self {
            UpstreamReader::Tcp(reader) => match reader.read(buf).await? {
                0 => Ok(None),
                n => Ok(Some(n)),
            },
            UpstreamReader::Udp(socket) => socket.recv(buf).await.map(Some),
        }
    }
}

/// Write side of one outbound connection owned by a tunnel.
pub struct UpstreamConnection {
    index: usize,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    writer: Writer,
    failed: bool,
}

impl UpstreamConnection {
    /// Dials `target` once. No retries.
    pub async fn dial(
        index: usize,
        transport: Transport,
        target: &str,
        connect_timeout: Duration,
    ) -> Result<(Self, UpstreamReader), UpstreamError> {
        let attempt = async {
            match transport {
                Transport::Tcp => Self::dial_tcp(index, target).await,
                Transport::Udp => Self::dial_udp(index, target).await,
            }
        };

        timeout(connect_timeout, attempt)
            .await
            .map_err(|_| UpstreamError::Timeout {
                target: target.to_string(),
                timeout: connect_timeout,
            })?
    }

    async fn dial_tcp(index: usize, target: &str) -> Result<(Self, UpstreamReader), UpstreamError> {
        let stream =
            TcpStream::connect(target)
                .await
                .map_err(|e| UpstreamError::ConnectionFailed {
                    target: target.to_string(),
                    source: e,
                })?;
        stream.set_nodelay(true)?;

        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();

        Ok((
            Self {
                index,
                local_addr,
                peer_addr,
                writer: Writer::Tcp(writer),
                failed: false,
            },
            UpstreamReader::Tcp(reader),
        ))
    }

    async fn dial_udp(index: usize, target: &str) -> Result<(Self, UpstreamReader), UpstreamError> {
        let peer = lookup_host(target)
            .await
            .map_err(|e| UpstreamError::ConnectionFailed {
                target: target.to_string(),
                source: e,
            })?
            .next()
            .ok_or_else(|| UpstreamError::Unresolved(target.to_string()))?;

        let bind_addr: SocketAddr = if peer.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, 0))
        };

        let socket = UdpSocket::bind(bind_addr).await?;
        socket
            .connect(peer)
            .await
            .map_err(|e| UpstreamError::ConnectionFailed {
                target: target.to_string(),
                source: e,
            })?;

        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);

        Ok((
            Self {
                index,
                local_addr,
                peer_addr: peer,
                writer: Writer::Udp(Arc::clone(&socket)),
                failed: false,
            },
            UpstreamReader::Udp(socket),
        ))
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// True once a write has failed; the connection is skipped afterwards.
    pub fn has_failed(&self) -> bool {
        self.failed
    }

    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    pub async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        match &mut self.writer {
            Writer::Tcp(writer) => writer.write_all(data).await,
            Writer::Udp(socket) => socket.send(data).await.map(|_| ()),
        }
    }

    /// Zero-length write issued just before close. On a stream this puts
    /// nothing on the wire; on a datagram socket it sends an empty datagram.
    pub async fn write_marker(&mut self) -> std::io::Result<()> {
        self.write(&[]).await
    }

    /// Shuts down the write direction. The socket itself is released once the
    /// drainer holding the read side has also been dropped.
    pub async fn close(self) {
        if let Writer::Tcp(mut writer) = self.writer {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(
                    "Shutdown of upstream {} -> {} failed: {}",
                    self.local_addr,
                    self.peer_addr,
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_tcp_and_write() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let (mut conn, _reader) =
            UpstreamConnection::dial(0, Transport::Tcp, &addr, Duration::from_secs(1))
                .await
                .unwrap();
        let (mut accepted, _) = listener.accept().await.unwrap();

        conn.write(b"hello").await.unwrap();
        conn.write_marker().await.unwrap();
        conn.close().await;

        let mut received = Vec::new();
        accepted.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello");
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result =
            UpstreamConnection::dial(0, Transport::Tcp, &addr, Duration::from_secs(1)).await;
        assert!(matches!(
            result,
            Err(UpstreamError::ConnectionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_dial_udp_sends_datagrams() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();

        let (mut conn, _reader) =
            UpstreamConnection::dial(0, Transport::Udp, &addr, Duration::from_secs(1))
                .await
                .unwrap();
        conn.write(b"ping").await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from.port(), conn.local_addr().port());
    }
}
