//! SecureTunnel VPN - Session Orchestration Core
//!
//! Manages one VPN tunnel session for one user: picks a server from the
//! catalog, checks the subscription may use it, drives the tunnel through
//! its lifecycle, meters traffic and reconnects after unexpected drops.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                       Presentation (CLI / UI)                  │
//! │     connect / disconnect / snapshot          subscribe         │
//! └─────────────┬──────────────────────────────────────▲──────────┘
//!               │ commands                             │ snapshots
//!               ▼                                      │
//! ┌────────────────────────────────────────────┐  ┌────┴────────┐
//! │              Session Manager               │─▶│ SnapshotHub │
//! │  ┌──────────┐  ┌───────────┐  ┌─────────┐  │  └─────────────┘
//! │  │Admission │  │ Reconnect │  │ Traffic │  │
//! │  │          │  │ Supervisor│  │  Meter  │  │
//! │  └────▲─────┘  └───────────┘  └────┬────┘  │
//! └───────┼────────────────────────────┼───────┘
//!         │                            │ open / close / sample
//! ┌───────┴────────┐  ┌────────────────▼──────────────┐
//! │ServerDirectory │  │      TransportAdapter         │
//! │ + Subscription │  │ (SimulatedTransport / real)   │
//! └────────────────┘  └───────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Single writer**: one task owns the session; snapshots arrive in
//!   transition order with no gaps
//! - **Cancellation**: disconnect aborts a handshake or backoff, and a late
//!   tunnel is closed instead of leaked
//! - **Reconnect**: bounded exponential backoff with jitter
//! - **Pluggable transport**: XRay/V2Fly backends sit behind one trait

mod admission;
mod config;
mod directory;
mod format;
mod hub;
mod manager;
mod meter;
mod server;
mod session;
mod simulated;
mod subscription;
mod supervisor;
mod transport;

pub use admission::{can_connect, Admission, DenyReason};
pub use config::{ConfigError, CoreConfig, MeterConfig, SessionOptions, TransportConfig};
pub use directory::{CatalogCounts, DirectoryError, ServerDirectory};
pub use format::{format_bytes, format_elapsed};
pub use hub::{SnapshotHub, SnapshotStream, Unsubscribe};
pub use manager::SessionManager;
pub use meter::{TrafficMeter, DEFAULT_INTERVAL as DEFAULT_METER_INTERVAL};
pub use server::{
    CoreType, CountryGroup, ParseValueError, ServerDescriptor, ServerFilter, ServerStatus, Tier,
};
pub use session::{PhaseKind, RetryProgress, SessionError, SessionPhase, SessionSnapshot};
pub use simulated::{OpenOutcome, SimulatedTransport, DEFAULT_HANDSHAKE};
pub use subscription::{SharedSubscription, Subscription, SubscriptionSource};
pub use supervisor::{FailureOrigin, ReconnectSupervisor, RetryDecision, RetryPolicy, RetryState};
pub use transport::{TrafficSample, TransportAdapter, TransportError, TunnelHandle};

/// Re-exported so adapters can implement [`TransportAdapter`]
pub use async_trait::async_trait;
