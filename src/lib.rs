//! netcopy - amplifying flow relay
//!
//! netcopy replays observed network flows onto one or more upstream
//! connections. Every flow gets its own tunnel that dials the target N times
//! and writes each payload, unmodified and in order, to all N connections.

pub mod config;
pub mod flow;
pub mod network;
pub mod relay;
pub mod tunnel;

pub use config::{load_config, Config};
pub use flow::{CloseReason, FlowEvent, FlowKey, Segment, TcpFlags, Transport};
pub use relay::Relay;
pub use tunnel::{TunnelConfig, TunnelHandle, TunnelRegistry, TunnelState};
