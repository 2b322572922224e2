//! Flow identity and the events a capture facility feeds into the relay.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(Transport::Tcp),
            "udp" => Ok(Transport::Udp),
            other => Err(format!("unsupported transport '{}'", other)),
        }
    }
}

/// Identifies one observed flow by its source endpoint and protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub source: SocketAddr,
    pub transport: Transport,
}

impl FlowKey {
    pub fn new(source: SocketAddr, transport: Transport) -> Self {
        Self { source, transport }
    }

    pub fn tcp(source: SocketAddr) -> Self {
        Self::new(source, Transport::Tcp)
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.transport, self.source)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Reset,
    Fin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowEvent {
    Open { key: FlowKey },
    Data { key: FlowKey, payload: Bytes },
    Close { key: FlowKey, reason: CloseReason },
}

// TCP header flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags(u8);

impl TcpFlags {
    pub const FIN: Self = Self(0x01);
    pub const SYN: Self = Self(0x02);
    pub const RST: Self = Self(0x04);
    pub const PSH: Self = Self(0x08);
    pub const ACK: Self = Self(0x10);

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with(mut self, flag: Self) -> Self {
        self.0 |= flag.0;
        self
    }

    pub fn has(&self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }
}

/// A decoded segment as handed over by the capture facility.
#[derive(Debug, Clone)]
pub struct Segment {
    pub source: SocketAddr,
    pub transport: Transport,
    pub flags: TcpFlags,
    pub payload: Bytes,
}

impl Segment {
    pub fn tcp(source: SocketAddr, flags: TcpFlags, payload: impl Into<Bytes>) -> Self {
        Self {
            source,
            transport: Transport::Tcp,
            flags,
            payload: payload.into(),
        }
    }

    pub fn key(&self) -> FlowKey {
        FlowKey::new(self.source, self.transport)
    }

    /// Locates flow boundaries in a segment. Payload bytes are never inspected.
    ///
    /// A SYN without ACK opens the flow, RST closes it and discards the
    /// payload, FIN closes it after any payload it carries. Observed UDP
    /// traffic has no boundaries and produces nothing.
    pub fn into_events(self) -> Vec<FlowEvent> {
        if self.transport != Transport::Tcp {
            return Vec::new();
        }

        let key = self.key();
        let mut events = Vec::with_capacity(2);

        if self.flags.has(TcpFlags::RST) {
            events.push(FlowEvent::Close {
                key,
                reason: CloseReason::Reset,
            });
            return events;
        }

        if self.flags.has(TcpFlags::SYN) && !self.flags.has(TcpFlags::ACK) {
            events.push(FlowEvent::Open { key });
        }

        if !self.payload.is_empty() {
            events.push(FlowEvent::Data {
                key,
                payload: self.payload,
            });
        }

        if self.flags.has(TcpFlags::FIN) {
            events.push(FlowEvent::Close {
                key,
                reason: CloseReason::Fin,
            });
        }

        events
    }
}
