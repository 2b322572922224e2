pub mod metrics;
pub mod registry;
pub mod session;

pub use metrics::{MetricsSnapshot, RelayMetrics};
pub use registry::TunnelRegistry;
pub use session::{
    TunnelConfig, TunnelError, TunnelHandle, TunnelState, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_DRAIN_BUFFER_SIZE, DEFAULT_IDLE_TIMEOUT, DEFAULT_QUEUE_CAPACITY,
};
