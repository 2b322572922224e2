use super::metrics::RelayMetrics;
use super::session::{Tunnel, TunnelConfig, TunnelHandle};
use crate::flow::FlowKey;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

pub(crate) type TunnelMap = RwLock<HashMap<FlowKey, Arc<TunnelHandle>>>;

/// Maps each active flow to its tunnel.
///
/// The map is the only state shared across tasks. Lookups clone the handle
/// out and release the lock before enqueueing, so a full tunnel queue never
/// holds the registry lock.
pub struct TunnelRegistry {
    tunnels: Arc<TunnelMap>,
    next_id: AtomicU64,
    metrics: Arc<RelayMetrics>,
}

impl TunnelRegistry {
    pub fn new(metrics: Arc<RelayMetrics>) -> Self {
        Self {
            tunnels: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    /// Starts a tunnel for `key`, replacing (and closing) any tunnel already
    /// mapped to it. Dialing happens in the background.
    pub async fn open(&self, key: FlowKey, config: TunnelConfig) -> Arc<TunnelHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        // Held across spawn so a tunnel that fails instantly cannot try to
        // remove its entry before it is inserted.
        let mut tunnels = self.tunnels.write().await;
        let handle = Tunnel::spawn(
            id,
            key,
            config,
            Arc::downgrade(&self.tunnels),
            Arc::clone(&self.metrics),
        );
        self.metrics.record_tunnel_opened();

        if let Some(displaced) = tunnels.insert(key, Arc::clone(&handle)) {
            tracing::debug!(
                "Flow {} reopened; closing previous tunnel {}",
                key,
                displaced.id()
            );
            displaced.close();
        }

        handle
    }

    /// Enqueues `payload` on the flow's tunnel, waiting if its queue is full.
    /// Unknown flows and empty payloads are dropped.
    pub async fn forward(&self, key: &FlowKey, payload: Bytes) -> bool {
        if payload.is_empty() {
            return false;
        }

        let handle = self.get(key).await;
        let delivered = match handle {
            Some(handle) => handle.forward(payload).await,
            None => false,
        };

        if !delivered {
            tracing::trace!("Dropping payload for flow {}: no active tunnel", key);
            self.metrics.record_payload_dropped();
        }
        delivered
    }

    /// Removes the flow's entry and signals its tunnel to close.
    pub async fn close(&self, key: &FlowKey) -> bool {
        let handle = self.tunnels.write().await.remove(key);
        match handle {
            Some(handle) => handle.close(),
            None => false,
        }
    }

    pub async fn close_all(&self) -> Vec<Arc<TunnelHandle>> {
        let drained: Vec<_> = self.tunnels.write().await.drain().map(|(_, h)| h).collect();
        for handle in &drained {
            handle.close();
        }
        drained
    }

    pub async fn get(&self, key: &FlowKey) -> Option<Arc<TunnelHandle>> {
        self.tunnels.read().await.get(key).cloned()
    }

    pub async fn contains(&self, key: &FlowKey) -> bool {
        self.tunnels.read().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.tunnels.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tunnels.read().await.is_empty()
    }
}
