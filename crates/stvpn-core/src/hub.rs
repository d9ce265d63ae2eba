//! Snapshot Fan-out
//!
//! Delivers every published [`SessionSnapshot`] to every subscriber, in
//! publish order, with no gaps.
//!
//! Each subscriber owns an unbounded queue, so a slow consumer never stalls
//! the publisher or other subscribers. Registration and publication share
//! one lock: a new subscriber first receives the latest snapshot and then
//! exactly the snapshots published after it.

use crate::session::SessionSnapshot;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

struct HubState {
    latest: SessionSnapshot,
    closed: bool,
    next_id: u64,
    subscribers: Vec<(u64, mpsc::UnboundedSender<SessionSnapshot>)>,
}

/// Single-publisher, many-subscriber snapshot channel
pub struct SnapshotHub {
    state: Mutex<HubState>,
}

impl SnapshotHub {
    pub fn new(initial: SessionSnapshot) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HubState {
                latest: initial,
                closed: false,
                next_id: 0,
                subscribers: Vec::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Latest published snapshot
    pub fn latest(&self) -> SessionSnapshot {
        self.lock().latest.clone()
    }

    /// Publish to all subscribers; closed subscribers are pruned
    pub fn publish(&self, snapshot: SessionSnapshot) {
        let mut state = self.lock();
        state
            .subscribers
            .retain(|(_, tx)| tx.send(snapshot.clone()).is_ok());
        state.latest = snapshot;
    }

    /// Open a stream that starts with the latest snapshot
    pub fn subscribe(self: &Arc<Self>) -> SnapshotStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;

        let _ = tx.send(state.latest.clone());
        if !state.closed {
            state.subscribers.push((id, tx));
            debug!("Snapshot subscriber {} registered", id);
        }

        SnapshotStream {
            id,
            rx,
            hub: Arc::downgrade(self),
        }
    }

    /// Stop delivery: every stream ends after draining what it already has.
    ///
    /// Later subscribers receive the final snapshot and then end.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.subscribers.clear();
        debug!("Snapshot hub closed");
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    fn remove(&self, id: u64) {
        self.lock().subscribers.retain(|(sid, _)| *sid != id);
        debug!("Snapshot subscriber {} removed", id);
    }
}

/// Ordered stream of snapshots; unsubscribes when dropped
pub struct SnapshotStream {
    id: u64,
    rx: mpsc::UnboundedReceiver<SessionSnapshot>,
    hub: Weak<SnapshotHub>,
}

impl SnapshotStream {
    /// Next snapshot, or `None` once the hub is closed and drained
    pub async fn recv(&mut self) -> Option<SessionSnapshot> {
        self.rx.recv().await
    }

    /// Next snapshot if one is already queued
    pub fn try_recv(&mut self) -> Option<SessionSnapshot> {
        self.rx.try_recv().ok()
    }

    /// Skip ahead to the first snapshot matching `pred`
    pub async fn wait_for<F>(&mut self, mut pred: F) -> Option<SessionSnapshot>
    where
        F: FnMut(&SessionSnapshot) -> bool,
    {
        while let Some(snapshot) = self.rx.recv().await {
            if pred(&snapshot) {
                return Some(snapshot);
            }
        }
        None
    }

    /// [`wait_for`](Self::wait_for) bounded by `timeout`
    pub async fn wait_for_within<F>(&mut self, timeout: Duration, pred: F) -> Option<SessionSnapshot>
    where
        F: FnMut(&SessionSnapshot) -> bool,
    {
        tokio::time::timeout(timeout, self.wait_for(pred))
            .await
            .ok()
            .flatten()
    }
}

impl Drop for SnapshotStream {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(self.id);
        }
    }
}

/// Callback subscription; dropping or calling [`unsubscribe`](Self::unsubscribe)
/// stops delivery
pub struct Unsubscribe {
    task: JoinHandle<()>,
}

impl Unsubscribe {
    /// Run `callback` for every snapshot of `stream` on its own task
    pub(crate) fn spawn<F>(mut stream: SnapshotStream, mut callback: F) -> Self
    where
        F: FnMut(&SessionSnapshot) + Send + 'static,
    {
        let task = tokio::spawn(async move {
            while let Some(snapshot) = stream.recv().await {
                callback(&snapshot);
            }
        });
        Self { task }
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionPhase;

    fn snapshot(sequence: u64) -> SessionSnapshot {
        SessionSnapshot {
            sequence,
            ..SessionSnapshot::initial()
        }
    }

    #[tokio::test]
    async fn test_subscriber_sees_latest_then_updates() {
        let hub = SnapshotHub::new(snapshot(0));
        hub.publish(snapshot(1));

        let mut stream = hub.subscribe();
        hub.publish(snapshot(2));
        hub.publish(snapshot(3));

        let seqs: Vec<_> = [
            stream.recv().await.unwrap(),
            stream.recv().await.unwrap(),
            stream.recv().await.unwrap(),
        ]
        .iter()
        .map(|s| s.sequence)
        .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(stream.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let hub = SnapshotHub::new(snapshot(0));
        let stream = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);

        drop(stream);
        assert_eq!(hub.subscriber_count(), 0);
        hub.publish(snapshot(1));
        assert_eq!(hub.latest().sequence, 1);
    }

    #[tokio::test]
    async fn test_wait_for() {
        let hub = SnapshotHub::new(snapshot(0));
        let mut stream = hub.subscribe();
        for seq in 1..=5 {
            hub.publish(snapshot(seq));
        }

        let hit = stream.wait_for(|s| s.sequence == 4).await.unwrap();
        assert_eq!(hit.sequence, 4);
        assert_eq!(stream.recv().await.unwrap().sequence, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_within_times_out() {
        let hub = SnapshotHub::new(snapshot(0));
        let mut stream = hub.subscribe();

        let miss = stream
            .wait_for_within(Duration::from_secs(1), |s| !s.phase.is_idle())
            .await;
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let hub = SnapshotHub::new(snapshot(0));
        let mut stream = hub.subscribe();
        hub.publish(snapshot(1));
        hub.close();

        assert_eq!(stream.recv().await.unwrap().sequence, 0);
        assert_eq!(stream.recv().await.unwrap().sequence, 1);
        assert!(stream.recv().await.is_none());
        assert_eq!(hub.subscriber_count(), 0);

        let mut late = hub.subscribe();
        assert_eq!(late.recv().await.unwrap().sequence, 1);
        assert!(late.recv().await.is_none());
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_callback_unsubscribe() {
        let hub = SnapshotHub::new(snapshot(0));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let sub = Unsubscribe::spawn(hub.subscribe(), move |s| {
            let _ = tx.send(s.sequence);
        });
        hub.publish(snapshot(1));
        assert_eq!(rx.recv().await, Some(0));
        assert_eq!(rx.recv().await, Some(1));

        sub.unsubscribe();
        // Task aborted: the sender inside the callback is dropped
        assert_eq!(rx.recv().await, None);
        assert_eq!(hub.subscriber_count(), 0);
        assert_eq!(hub.latest().phase, SessionPhase::Idle);
    }
}
