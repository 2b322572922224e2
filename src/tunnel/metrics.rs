use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the registry and every tunnel it spawns.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    tunnels_opened: AtomicU64,
    tunnels_closed: AtomicU64,
    dial_failures: AtomicU64,
    idle_timeouts: AtomicU64,
    payloads_forwarded: AtomicU64,
    bytes_written: AtomicU64,
    payloads_dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub tunnels_opened: u64,
    pub tunnels_closed: u64,
    pub dial_failures: u64,
    pub idle_timeouts: u64,
    pub payloads_forwarded: u64,
    pub bytes_written: u64,
    pub payloads_dropped: u64,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tunnel_opened(&self) {
        self.tunnels_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tunnel_closed(&self) {
        self.tunnels_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dial_failure(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_idle_timeout(&self) {
        self.idle_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_payload_forwarded(&self) {
        self.payloads_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Counted once per upstream connection written.
    pub fn record_bytes_written(&self, bytes: usize) {
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_payload_dropped(&self) {
        self.payloads_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tunnels_opened: self.tunnels_opened.load(Ordering::Relaxed),
            tunnels_closed: self.tunnels_closed.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            idle_timeouts: self.idle_timeouts.load(Ordering::Relaxed),
            payloads_forwarded: self.payloads_forwarded.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            payloads_dropped: self.payloads_dropped.load(Ordering::Relaxed),
        }
    }
}
