use crate::flow::{CloseReason, FlowEvent, FlowKey};
use bytes::BytesMut;
use std::net::SocketAddr;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

pub struct TapConfig {
    pub bind_addr: SocketAddr,
    pub read_buffer_size: usize,
}

impl Default for TapConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 4000)),
            read_buffer_size: 65536,
        }
    }
}

/// Local flow source: every accepted TCP client is treated as an observed
/// flow keyed by its peer address.
pub struct TapListener {
    config: TapConfig,
    listener: TcpListener,
}

impl TapListener {
    pub async fn bind(config: TapConfig) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        tracing::info!("Tap listening on {}", listener.local_addr()?);
        Ok(Self { config, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Accepts clients until shutdown, publishing their flow events.
    pub async fn run(
        self,
        events: mpsc::Sender<FlowEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), std::io::Error> {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    stream.set_nodelay(true)?;
                    let events = events.clone();
                    let buffer_size = self.config.read_buffer_size;
                    tokio::spawn(async move {
                        tap_flow(stream, peer, buffer_size, events).await;
                    });
                }
            }
        }

        Ok(())
    }
}

async fn tap_flow(
    mut stream: TcpStream,
    peer: SocketAddr,
    buffer_size: usize,
    events: mpsc::Sender<FlowEvent>,
) {
    let key = FlowKey::tcp(peer);
    tracing::debug!("Tap accepted flow {}", key);

    if events.send(FlowEvent::Open { key }).await.is_err() {
        return;
    }

    let mut buf = BytesMut::with_capacity(buffer_size);
    let reason = loop {
        buf.reserve(buffer_size);
        match stream.read_buf(&mut buf).await {
            Ok(0) => break CloseReason::Fin,
            Ok(_) => {
                let payload = buf.split().freeze();
                // Queue back-pressure stalls this client's reads.
                if events.send(FlowEvent::Data { key, payload }).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::debug!("Tap flow {} read error: {}", key, e);
                break CloseReason::Reset;
            }
        }
    };

    let _ = events.send(FlowEvent::Close { key, reason }).await;
}
