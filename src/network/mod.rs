pub mod drain;
pub mod listener;
pub mod upstream;

pub use drain::{DrainOutcome, Drainer};
pub use listener::{TapConfig, TapListener};
pub use upstream::{UpstreamConnection, UpstreamError, UpstreamReader};
