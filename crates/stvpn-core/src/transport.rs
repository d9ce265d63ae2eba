//! Transport Adapter
//!
//! The seam between session orchestration and a concrete tunnel protocol.
//! The session manager only ever talks to `dyn TransportAdapter`, so a real
//! xray/v2fly backend and the [`SimulatedTransport`](crate::SimulatedTransport)
//! are interchangeable.
//!
//! # Contract
//!
//! - `open` may suspend for as long as the handshake takes
//! - `close` releases the tunnel; closing an unknown handle is an error
//! - `sample` must not block; it returns the latest known counters and
//!   fails once the tunnel is gone

use crate::server::{CoreType, ServerDescriptor};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;

/// Opaque reference to an open tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TunnelHandle(u64);

impl TunnelHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TunnelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tunnel#{}", self.0)
    }
}

/// Cumulative byte counters for one tunnel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrafficSample {
    pub bytes_up: u64,
    pub bytes_down: u64,
}

impl TrafficSample {
    pub fn new(bytes_up: u64, bytes_down: u64) -> Self {
        Self { bytes_up, bytes_down }
    }
}

/// Tunnel backend
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Establish a tunnel to `server`
    async fn open(&self, server: &ServerDescriptor) -> Result<TunnelHandle, TransportError>;

    /// Tear down a tunnel
    async fn close(&self, handle: TunnelHandle) -> Result<(), TransportError>;

    /// Latest counters for `handle`
    fn sample(&self, handle: TunnelHandle) -> Result<TrafficSample, TransportError>;
}

/// Transport errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Handshake timeout")]
    HandshakeTimeout,

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Unknown tunnel handle: {0}")]
    UnknownHandle(TunnelHandle),

    #[error("Unsupported core type: {0}")]
    Unsupported(CoreType),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}
