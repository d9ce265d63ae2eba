//! Shared fixtures for the session scenarios

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use stvpn_core::{
    RetryPolicy, ServerDescriptor, ServerDirectory, SessionManager, SessionOptions,
    SessionSnapshot, SimulatedTransport, SnapshotStream, SubscriptionSource,
};

pub const HANDSHAKE: Duration = Duration::from_millis(100);
pub const METER: Duration = Duration::from_secs(1);
pub const WAIT: Duration = Duration::from_secs(300);

pub struct Harness {
    pub manager: SessionManager,
    pub transport: Arc<SimulatedTransport>,
}

pub fn options(retry: RetryPolicy) -> SessionOptions {
    SessionOptions {
        meter_interval: METER,
        open_timeout: Duration::from_secs(15),
        retry,
    }
}

pub fn harness(subscription: Arc<dyn SubscriptionSource>) -> Harness {
    harness_with(
        subscription,
        SimulatedTransport::new().with_handshake(HANDSHAKE).with_seed(11),
        RetryPolicy::fixed(3, Duration::from_secs(1), Duration::from_secs(30)),
    )
}

pub fn harness_with(
    subscription: Arc<dyn SubscriptionSource>,
    transport: SimulatedTransport,
    retry: RetryPolicy,
) -> Harness {
    let directory = Arc::new(ServerDirectory::new(ServerDescriptor::default_catalog()).unwrap());
    let transport = Arc::new(transport);
    let manager = SessionManager::spawn(directory, subscription, transport.clone(), options(retry));
    Harness { manager, transport }
}

/// Collect snapshots up to and including the first one matching `pred`
pub async fn collect_until<F>(stream: &mut SnapshotStream, mut pred: F) -> Vec<SessionSnapshot>
where
    F: FnMut(&SessionSnapshot) -> bool,
{
    let collect = async {
        let mut seen = Vec::new();
        while let Some(snapshot) = stream.recv().await {
            let done = pred(&snapshot);
            seen.push(snapshot);
            if done {
                break;
            }
        }
        seen
    };
    tokio::time::timeout(WAIT, collect)
        .await
        .expect("snapshot never arrived")
}

/// Drain whatever is already queued
pub fn drain(stream: &mut SnapshotStream) -> Vec<SessionSnapshot> {
    let mut seen = Vec::new();
    while let Some(snapshot) = stream.try_recv() {
        seen.push(snapshot);
    }
    seen
}
