//! Tests that drive the relay from flow sources: decoded TCP segments and
//! the local tap listener.

use bytes::Bytes;
use netcopy::network::{TapConfig, TapListener};
use netcopy::tunnel::{RelayMetrics, TunnelConfig, TunnelRegistry};
use netcopy::{FlowKey, Relay, Segment, TcpFlags, Transport};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

async fn start_observer() -> (String, mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut received = Vec::new();
                let _ = socket.read_to_end(&mut received).await;
                let _ = tx.send(received);
            });
        }
    });

    (addr, rx)
}

async fn next_stream(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<u8> {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for upstream connection to close")
        .expect("observer stopped")
}

fn relay(target: &str, amplification: usize) -> Relay {
    let registry = Arc::new(TunnelRegistry::new(Arc::new(RelayMetrics::new())));
    Relay::new(
        registry,
        TunnelConfig::new(target, Transport::Tcp, amplification)
            .with_idle_timeout(Duration::from_secs(30)),
    )
}

#[tokio::test]
async fn test_captured_segments_drive_tunnel() {
    let (target, mut streams) = start_observer().await;
    let relay = relay(&target, 1);
    let client: SocketAddr = "10.0.0.5:4000".parse().unwrap();

    let segments = vec![
        Segment::tcp(client, TcpFlags::new().with(TcpFlags::SYN), Bytes::new()),
        Segment::tcp(client, TcpFlags::new().with(TcpFlags::ACK), Bytes::new()),
        Segment::tcp(
            client,
            TcpFlags::new().with(TcpFlags::ACK).with(TcpFlags::PSH),
            &b"GET / HTTP/1.1\r\n"[..],
        ),
        Segment::tcp(
            client,
            TcpFlags::new().with(TcpFlags::ACK).with(TcpFlags::FIN),
            &b"\r\n"[..],
        ),
    ];

    for segment in segments {
        for event in segment.into_events() {
            relay.handle(event).await;
        }
    }

    assert_eq!(next_stream(&mut streams).await, b"GET / HTTP/1.1\r\n\r\n");
    assert!(!relay.registry().contains(&FlowKey::tcp(client)).await);
}

#[tokio::test]
async fn test_reset_segment_tears_down_tunnel() {
    let (target, mut streams) = start_observer().await;
    let relay = relay(&target, 2);
    let client: SocketAddr = "10.0.0.5:4000".parse().unwrap();

    let open = Segment::tcp(client, TcpFlags::new().with(TcpFlags::SYN), &b"one"[..]);
    let reset = Segment::tcp(client, TcpFlags::new().with(TcpFlags::RST), &b"ignored"[..]);

    for event in open.into_events().into_iter().chain(reset.into_events()) {
        relay.handle(event).await;
    }

    assert_eq!(next_stream(&mut streams).await, b"one");
    assert_eq!(next_stream(&mut streams).await, b"one");
}

#[tokio::test]
async fn test_data_before_open_is_dropped() {
    let (target, _streams) = start_observer().await;
    let relay = relay(&target, 1);
    let client: SocketAddr = "10.0.0.5:4000".parse().unwrap();

    let stray = Segment::tcp(client, TcpFlags::new().with(TcpFlags::ACK), &b"stray"[..]);
    for event in stray.into_events() {
        relay.handle(event).await;
    }

    assert!(relay.registry().is_empty().await);
    assert_eq!(relay.registry().metrics().snapshot().payloads_dropped, 1);
}

#[tokio::test]
async fn test_tap_listener_relays_client_traffic() {
    let (target, mut streams) = start_observer().await;
    let relay = relay(&target, 2);

    let tap = TapListener::bind(TapConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        read_buffer_size: 1024,
    })
    .await
    .unwrap();
    let tap_addr = tap.local_addr().unwrap();

    let (event_tx, event_rx) = mpsc::channel(10);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(tap.run(event_tx, shutdown_rx.clone()));
    let relay_task = tokio::spawn(relay.run(event_rx, shutdown_rx));

    let mut client = TcpStream::connect(tap_addr).await.unwrap();
    client.write_all(b"hello upstream").await.unwrap();
    client.shutdown().await.unwrap();

    assert_eq!(next_stream(&mut streams).await, b"hello upstream");
    assert_eq!(next_stream(&mut streams).await, b"hello upstream");

    shutdown_tx.send(true).unwrap();
    timeout(Duration::from_secs(5), relay_task)
        .await
        .unwrap()
        .unwrap();
}
