use super::upstream::UpstreamReader;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;

/// Why a drainer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The owning tunnel signalled shutdown.
    Cancelled,
    /// Upstream ended the stream.
    PeerClosed,
    /// A non-transient read error.
    Failed,
}

/// Reads and discards everything the upstream sends back.
///
/// Each read is bounded by `read_timeout`; an expired deadline just starts
/// the next read. The drainer never touches the write side and its exit
/// never tears down the tunnel.
pub struct Drainer {
    label: String,
    reader: UpstreamReader,
    read_timeout: Duration,
    buffer_size: usize,
    shutdown: watch::Receiver<bool>,
    bytes_discarded: u64,
}

impl Drainer {
    pub fn new(
        label: String,
        reader: UpstreamReader,
        read_timeout: Duration,
        buffer_size: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            label,
            reader,
            read_timeout,
            buffer_size,
            shutdown,
            bytes_discarded: 0,
        }
    }

    pub async fn run(mut self) -> DrainOutcome {
        let mut buf = vec![0u8; self.buffer_size];

        loop {
            if *self.shutdown.borrow() {
                return DrainOutcome::Cancelled;
            }

            tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    // A dropped sender means the tunnel is gone as well.
                    if changed.is_err() || *self.shutdown.borrow() {
                        return DrainOutcome::Cancelled;
                    }
                }
                result = timeout(self.read_timeout, self.reader.read(&mut buf)) => {
                    match result {
                        Err(_) => continue,
                        Ok(Ok(Some(n))) => {
                            self.bytes_discarded += n as u64;
                        }
                        Ok(Ok(None)) => {
                            tracing::debug!(
                                "Stop draining {}: peer closed after {} bytes",
                                self.label,
                                self.bytes_discarded
                            );
                            return DrainOutcome::PeerClosed;
                        }
                        Ok(Err(e)) if is_transient(&e) => continue,
                        Ok(Err(e)) => {
                            tracing::warn!("Stop draining {}: {}", self.label, e);
                            return DrainOutcome::Failed;
                        }
                    }
                }
            }
        }
    }
}

fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
    )
}
