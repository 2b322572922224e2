use super::metrics::RelayMetrics;
use super::registry::TunnelMap;
use crate::flow::{FlowKey, Transport};
use crate::network::{DrainOutcome, Drainer, UpstreamConnection, UpstreamError, UpstreamReader};
use bytes::Bytes;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;

pub const DEFAULT_QUEUE_CAPACITY: usize = 10;
pub const DEFAULT_DRAIN_BUFFER_SIZE: usize = 65536;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a tunnel needs, fixed for its whole life.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub target: String,
    pub transport: Transport,
    pub amplification: usize,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub queue_capacity: usize,
    pub drain_buffer_size: usize,
}

impl TunnelConfig {
    pub fn new(target: impl Into<String>, transport: Transport, amplification: usize) -> Self {
        Self {
            target: target.into(),
            transport,
            amplification,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            drain_buffer_size: DEFAULT_DRAIN_BUFFER_SIZE,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TunnelState {
    Created,
    Dialing,
    Active,
    Closing,
    Closed,
}

impl TunnelState {
    pub fn is_terminating(&self) -> bool {
        *self >= TunnelState::Closing
    }
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Dial {attempt} of {amplification} failed: {source}")]
    DialFailed {
        attempt: usize,
        amplification: usize,
        #[source]
        source: UpstreamError,
    },

    #[error("Amplification must be at least 1")]
    NoConnections,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitReason {
    CloseSignal,
    IdleTimeout,
    Released,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::CloseSignal => f.write_str("close requested"),
            ExitReason::IdleTimeout => f.write_str("idle timeout"),
            ExitReason::Released => f.write_str("handle released"),
        }
    }
}

/// External view of a running tunnel. All interaction goes through the
/// bounded data queue and the one-shot close signal.
pub struct TunnelHandle {
    id: u64,
    key: FlowKey,
    data_tx: mpsc::Sender<Bytes>,
    close_tx: Mutex<Option<oneshot::Sender<()>>>,
    state_rx: watch::Receiver<TunnelState>,
}

impl TunnelHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    pub fn state(&self) -> TunnelState {
        *self.state_rx.borrow()
    }

    /// Enqueues a payload, waiting while the queue is full.
    /// Returns false once the tunnel has stopped accepting data.
    pub async fn forward(&self, payload: Bytes) -> bool {
        if self.state().is_terminating() {
            return false;
        }
        self.data_tx.send(payload).await.is_ok()
    }

    /// Signals the tunnel to close. Only the first call has any effect.
    pub fn close(&self) -> bool {
        if self.state().is_terminating() {
            return false;
        }

        let sender = match self.close_tx.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };

        match sender {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Waits until the tunnel has reached at least `target` and returns the
    /// state observed. A tunnel that failed to dial jumps straight to Closed.
    pub async fn wait_for(&self, target: TunnelState) -> TunnelState {
        let mut state_rx = self.state_rx.clone();
        let state = match state_rx.wait_for(|state| *state >= target).await {
            Ok(state) => *state,
            Err(_) => TunnelState::Closed,
        };
        state
    }

    pub async fn closed(&self) {
        self.wait_for(TunnelState::Closed).await;
    }
}

impl fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelHandle")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

/// Per-flow relay session. Owned by its dispatch task; nothing outside the
/// task touches the connections.
pub(crate) struct Tunnel {
    id: u64,
    key: FlowKey,
    config: TunnelConfig,
    data_rx: mpsc::Receiver<Bytes>,
    close_rx: oneshot::Receiver<()>,
    state_tx: watch::Sender<TunnelState>,
    upstreams: Vec<UpstreamConnection>,
    drainers: JoinSet<DrainOutcome>,
    drain_stop: watch::Sender<bool>,
    registry: Weak<TunnelMap>,
    metrics: Arc<RelayMetrics>,
}

impl Tunnel {
    /// Starts the dispatch task and returns immediately; dialing happens
    /// inside the task.
    pub(crate) fn spawn(
        id: u64,
        key: FlowKey,
        config: TunnelConfig,
        registry: Weak<TunnelMap>,
        metrics: Arc<RelayMetrics>,
    ) -> Arc<TunnelHandle> {
        let (data_tx, data_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (close_tx, close_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(TunnelState::Created);
        let (drain_stop, _) = watch::channel(false);

        let handle = Arc::new(TunnelHandle {
            id,
            key,
            data_tx,
            close_tx: Mutex::new(Some(close_tx)),
            state_rx,
        });

        let tunnel = Tunnel {
            id,
            key,
            upstreams: Vec::with_capacity(config.amplification),
            config,
            data_rx,
            close_rx,
            state_tx,
            drainers: JoinSet::new(),
            drain_stop,
            registry,
            metrics,
        };

        tokio::spawn(tunnel.serve());
        handle
    }

    async fn serve(mut self) {
        self.set_state(TunnelState::Dialing);

        let readers = match self.dial().await {
            Ok(readers) => readers,
            Err(e) => {
                tracing::error!(
                    "Tunnel {} [{} {}] aborted: {}",
                    self.key,
                    self.config.transport,
                    self.config.target,
                    e
                );
                self.metrics.record_dial_failure();
                self.data_rx.close();
                self.release().await;
                self.finish().await;
                return;
            }
        };

        self.start_drainers(readers);
        self.set_state(TunnelState::Active);

        let reason = self.dispatch().await;

        // Late sends must fail rather than sit unread in the queue.
        self.data_rx.close();
        self.set_state(TunnelState::Closing);
        self.teardown(reason).await;
        self.finish().await;
    }

    /// All-or-nothing: any failed attempt aborts the tunnel.
    async fn dial(&mut self) -> Result<Vec<UpstreamReader>, TunnelError> {
        let amplification = self.config.amplification;
        if amplification == 0 {
            return Err(TunnelError::NoConnections);
        }

        let mut readers = Vec::with_capacity(amplification);
        for index in 0..amplification {
            let (conn, reader) = UpstreamConnection::dial(
                index,
                self.config.transport,
                &self.config.target,
                self.config.connect_timeout,
            )
            .await
            .map_err(|source| TunnelError::DialFailed {
                attempt: index + 1,
                amplification,
                source,
            })?;

            tracing::info!(
                "Create tunnel {} [{} -> {}]",
                self.key,
                conn.local_addr(),
                conn.peer_addr()
            );
            self.upstreams.push(conn);
            readers.push(reader);
        }

        Ok(readers)
    }

    fn start_drainers(&mut self, readers: Vec<UpstreamReader>) {
        for (conn, reader) in self.upstreams.iter().zip(readers) {
            let label = format!(
                "{} #{} [{} -> {}]",
                self.key,
                conn.index(),
                conn.local_addr(),
                conn.peer_addr()
            );
            let drainer = Drainer::new(
                label,
                reader,
                self.config.idle_timeout,
                self.config.drain_buffer_size,
                self.drain_stop.subscribe(),
            );
            self.drainers.spawn(drainer.run());
        }
    }

    async fn dispatch(&mut self) -> ExitReason {
        let idle_timeout = self.config.idle_timeout;

        loop {
            // Queued data wins over the close signal so nothing enqueued
            // before a close is lost.
            tokio::select! {
                biased;
                payload = self.data_rx.recv() => match payload {
                    Some(payload) => self.fan_out(&payload).await,
                    None => {
                        return match self.close_rx.try_recv() {
                            Ok(()) => ExitReason::CloseSignal,
                            Err(_) => ExitReason::Released,
                        };
                    }
                },
                signal = &mut self.close_rx => {
                    return match signal {
                        Ok(()) => ExitReason::CloseSignal,
                        Err(_) => ExitReason::Released,
                    };
                }
                _ = tokio::time::sleep(idle_timeout) => {
                    return ExitReason::IdleTimeout;
                }
            }
        }
    }

    async fn fan_out(&mut self, payload: &Bytes) {
        tracing::trace!(
            "Tunnel {} writing {} bytes to {} upstreams",
            self.key,
            payload.len(),
            self.upstreams.len()
        );

        for conn in self.upstreams.iter_mut().filter(|c| !c.has_failed()) {
            match conn.write(payload).await {
                Ok(()) => self.metrics.record_bytes_written(payload.len()),
                Err(e) => {
                    tracing::warn!(
                        "Tunnel {} upstream #{} {} -> {} write failed, skipping it: {}",
                        self.key,
                        conn.index(),
                        conn.local_addr(),
                        conn.peer_addr(),
                        e
                    );
                    conn.mark_failed();
                }
            }
        }

        self.metrics.record_payload_forwarded();
    }

    async fn teardown(&mut self, reason: ExitReason) {
        if reason == ExitReason::IdleTimeout {
            self.metrics.record_idle_timeout();
        }

        for mut conn in self.upstreams.drain(..) {
            if let Err(e) = conn.write_marker().await {
                tracing::debug!("Tunnel {} teardown marker failed: {}", self.key, e);
            }
            tracing::info!(
                "Close tunnel {} [{} -> {}] ({})",
                self.key,
                conn.local_addr(),
                conn.peer_addr(),
                reason
            );
            conn.close().await;
        }

        self.stop_drainers().await;
    }

    /// Releases connections opened before a failed dial. No marker is sent.
    async fn release(&mut self) {
        for conn in self.upstreams.drain(..) {
            conn.close().await;
        }
    }

    async fn stop_drainers(&mut self) {
        self.drain_stop.send_replace(true);

        while let Some(result) = self.drainers.join_next().await {
            match result {
                Ok(outcome) => {
                    tracing::trace!("Tunnel {} drainer finished: {:?}", self.key, outcome)
                }
                Err(e) => tracing::warn!("Tunnel {} drainer panicked: {}", self.key, e),
            }
        }
    }

    /// Drops the registry entry if it still points at this tunnel, then
    /// reports Closed.
    async fn finish(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut tunnels = registry.write().await;
            if tunnels.get(&self.key).map(|handle| handle.id()) == Some(self.id) {
                tunnels.remove(&self.key);
            }
        }

        self.metrics.record_tunnel_closed();
        self.set_state(TunnelState::Closed);
    }

    fn set_state(&self, state: TunnelState) {
        tracing::trace!("Tunnel {} -> {:?}", self.key, state);
        self.state_tx.send_replace(state);
    }
}
