//! Drives the tunnel registry from a stream of flow events.

use crate::flow::FlowEvent;
use crate::tunnel::{TunnelConfig, TunnelRegistry};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

pub struct Relay {
    registry: Arc<TunnelRegistry>,
    tunnel_config: TunnelConfig,
}

impl Relay {
    pub fn new(registry: Arc<TunnelRegistry>, tunnel_config: TunnelConfig) -> Self {
        Self {
            registry,
            tunnel_config,
        }
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.registry
    }

    /// Applies one event. A data event may wait on the tunnel's queue,
    /// which stalls the whole event stream behind the slowest tunnel.
    pub async fn handle(&self, event: FlowEvent) {
        match event {
            FlowEvent::Open { key } => {
                tracing::debug!("Flow {} opened", key);
                self.registry.open(key, self.tunnel_config.clone()).await;
            }
            FlowEvent::Data { key, payload } => {
                self.registry.forward(&key, payload).await;
            }
            FlowEvent::Close { key, reason } => {
                tracing::debug!("Flow {} closed by peer ({:?})", key, reason);
                self.registry.close(&key).await;
            }
        }
    }

    /// Processes events in arrival order until the source ends or shutdown
    /// is signalled, then closes every remaining tunnel and waits for them.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<FlowEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
            }
        }

        let remaining = self.registry.close_all().await;
        if !remaining.is_empty() {
            tracing::info!("Closing {} remaining tunnels", remaining.len());
        }
        for handle in remaining {
            handle.closed().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{CloseReason, FlowKey, Transport};
    use crate::tunnel::{RelayMetrics, TunnelState};
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_relay_applies_events_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();
        let registry = Arc::new(TunnelRegistry::new(Arc::new(RelayMetrics::new())));
        let relay = Relay::new(
            Arc::clone(&registry),
            TunnelConfig::new(target, Transport::Tcp, 1).with_idle_timeout(Duration::from_secs(30)),
        );

        let key = FlowKey::tcp("10.0.0.5:4000".parse().unwrap());
        relay.handle(FlowEvent::Open { key }).await;
        let handle = registry.get(&key).await.unwrap();

        relay
            .handle(FlowEvent::Data {
                key,
                payload: Bytes::from_static(b"A"),
            })
            .await;
        relay
            .handle(FlowEvent::Data {
                key,
                payload: Bytes::from_static(b"BB"),
            })
            .await;
        relay
            .handle(FlowEvent::Close {
                key,
                reason: CloseReason::Fin,
            })
            .await;

        let (mut accepted, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        accepted.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"ABB");

        handle.closed().await;
        assert_eq!(handle.state(), TunnelState::Closed);
    }

    #[tokio::test]
    async fn test_run_closes_tunnels_on_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();
        let registry = Arc::new(TunnelRegistry::new(Arc::new(RelayMetrics::new())));
        let relay = Relay::new(
            Arc::clone(&registry),
            TunnelConfig::new(target, Transport::Tcp, 1).with_idle_timeout(Duration::from_secs(30)),
        );

        let (event_tx, event_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn(relay.run(event_rx, shutdown_rx));

        let key = FlowKey::tcp("10.0.0.5:4000".parse().unwrap());
        event_tx.send(FlowEvent::Open { key }).await.unwrap();
        let _accepted = listener.accept().await.unwrap();

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();
        assert!(registry.is_empty().await);
    }
}
