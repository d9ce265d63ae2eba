//! Session Manager
//!
//! Owns the single tunnel session and drives it through its lifecycle:
//!
//! ```text
//!            connect (admitted)            transport opened
//!   Idle ─────────────────────▶ Connecting ─────────────────▶ Connected
//!    ▲  ◀── disconnect ─────────────┘  │ open failed              │  │
//!    │                                 ▼                          │  │ disconnect
//!    │◀──────────────────────────── Failed ◀──── transport lost ──┘  ▼
//!    │    retries exhausted /          │  ▲                     Disconnecting
//!    │    disconnect                   └──┘ retry failed              │
//!    │                                 │ retry succeeded → Connected  │
//!    └────────────────────────────────────────────────────────────────┘
//!                                                        transport closed
//! ```
//!
//! # Single writer
//!
//! All session state lives in one actor task. Callers talk to it through a
//! command channel; transport completions, meter readings and retry timers
//! come back through an event channel. Each message is handled to
//! completion before the next one, so transitions never interleave and
//! snapshots are published in transition order.
//!
//! # Cancellation
//!
//! Every background operation is tagged with the generation that started
//! it. Disconnect, reconnect and shutdown bump the generation, so a late
//! completion from an abandoned attempt is recognised as stale; a stale
//! successful `open` gets its tunnel closed immediately.
//!
//! # Usage
//!
//! ```rust,ignore
//! let manager = SessionManager::spawn(directory, subscription, transport, options);
//! let mut updates = manager.subscribe();
//!
//! manager.connect("1").await?;
//! updates.wait_for(|s| s.phase.is_connected()).await;
//!
//! manager.disconnect().await?;
//! ```

use crate::admission::can_connect;
use crate::config::SessionOptions;
use crate::directory::ServerDirectory;
use crate::hub::{SnapshotHub, SnapshotStream, Unsubscribe};
use crate::meter::TrafficMeter;
use crate::server::ServerDescriptor;
use crate::session::{SessionError, SessionPhase, SessionSnapshot};
use crate::subscription::SubscriptionSource;
use crate::supervisor::{FailureOrigin, ReconnectSupervisor, RetryDecision};
use crate::transport::{TrafficSample, TransportAdapter, TransportError, TunnelHandle};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Which server a connect request targets
#[derive(Debug, Clone)]
enum Target {
    Id(String),
    Fastest,
}

/// Requests from callers
enum Command {
    Connect {
        target: Target,
        reply: oneshot::Sender<Result<ServerDescriptor, SessionError>>,
    },
    Disconnect {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Completions from background work
enum Event {
    Opened {
        generation: u64,
        result: Result<TunnelHandle, TransportError>,
    },
    Reading {
        generation: u64,
        result: Result<TrafficSample, TransportError>,
    },
    Closed {
        generation: u64,
        result: Result<(), TransportError>,
    },
    RetryDue {
        generation: u64,
    },
}

/// Resources backing a `Connected` session.
///
/// Dropping this stops the traffic meter.
struct LiveTunnel {
    handle: TunnelHandle,
    _meter: TrafficMeter,
}

/// Handle to the session actor
///
/// Cheap to clone; all clones drive the same session. The actor stops once
/// every handle is dropped or [`shutdown`](Self::shutdown) is called.
#[derive(Clone)]
pub struct SessionManager {
    commands: mpsc::Sender<Command>,
    hub: Arc<SnapshotHub>,
    directory: Arc<ServerDirectory>,
}

impl SessionManager {
    /// Start the session actor. Must be called inside a tokio runtime.
    pub fn spawn(
        directory: Arc<ServerDirectory>,
        subscription: Arc<dyn SubscriptionSource>,
        transport: Arc<dyn TransportAdapter>,
        options: SessionOptions,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let hub = SnapshotHub::new(SessionSnapshot::initial());

        info!(
            "Session manager starting ({} transport, {} servers)",
            transport.name(),
            directory.len()
        );

        let actor = SessionActor {
            directory: directory.clone(),
            subscription,
            transport,
            hub: hub.clone(),
            events_tx,
            supervisor: ReconnectSupervisor::new(options.retry.clone()),
            options,
            phase: SessionPhase::Idle,
            last_error: None,
            tunnel: None,
            generation: 0,
            sequence: 0,
        };
        tokio::spawn(actor.run(commands_rx, events_rx));

        Self {
            commands: commands_tx,
            hub,
            directory,
        }
    }

    /// The catalog this manager resolves server ids against
    pub fn directory(&self) -> &Arc<ServerDirectory> {
        &self.directory
    }

    /// Request a connection to `server_id`.
    ///
    /// Returns once the request is admitted (session now `Connecting`) or
    /// refused. The handshake itself runs in the background; watch the
    /// snapshot stream for the outcome.
    pub async fn connect(&self, server_id: &str) -> Result<ServerDescriptor, SessionError> {
        self.request_connect(Target::Id(server_id.to_string())).await
    }

    /// Connect to the fastest server the current subscription may use
    pub async fn quick_connect(&self) -> Result<ServerDescriptor, SessionError> {
        self.request_connect(Target::Fastest).await
    }

    async fn request_connect(&self, target: Target) -> Result<ServerDescriptor, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect { target, reply })
            .await
            .map_err(|_| SessionError::Shutdown)?;
        rx.await.map_err(|_| SessionError::Shutdown)?
    }

    /// Leave the current session.
    ///
    /// Cancels a pending handshake or backoff. Returns once the request is
    /// accepted; the session reaches `Idle` after the transport closes.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Disconnect { reply })
            .await
            .map_err(|_| SessionError::Shutdown)?;
        rx.await.map_err(|_| SessionError::Shutdown)?
    }

    /// Tear down any tunnel, cancel all timers and stop the actor
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Latest snapshot; never blocks on a transition
    pub fn snapshot(&self) -> SessionSnapshot {
        self.hub.latest()
    }

    /// Ordered stream starting at the latest snapshot
    pub fn subscribe(&self) -> SnapshotStream {
        self.hub.subscribe()
    }

    /// Invoke `callback` for every snapshot on a separate task
    pub fn subscribe_fn<F>(&self, callback: F) -> Unsubscribe
    where
        F: FnMut(&SessionSnapshot) + Send + 'static,
    {
        Unsubscribe::spawn(self.hub.subscribe(), callback)
    }
}

/// The single writer of session state
struct SessionActor {
    directory: Arc<ServerDirectory>,
    subscription: Arc<dyn SubscriptionSource>,
    transport: Arc<dyn TransportAdapter>,
    hub: Arc<SnapshotHub>,
    events_tx: mpsc::UnboundedSender<Event>,
    options: SessionOptions,
    supervisor: ReconnectSupervisor,
    phase: SessionPhase,
    last_error: Option<SessionError>,
    tunnel: Option<LiveTunnel>,
    generation: u64,
    sequence: u64,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        loop {
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                command = commands.recv() => match command {
                    Some(Command::Connect { target, reply }) => {
                        let _ = reply.send(self.handle_connect(target));
                    }
                    Some(Command::Disconnect { reply }) => {
                        let _ = reply.send(self.handle_disconnect());
                    }
                    Some(Command::Shutdown { reply }) => {
                        self.teardown(&mut events).await;
                        let _ = reply.send(());
                        return;
                    }
                    None => break,
                },
            }
        }

        self.teardown(&mut events).await;
    }

    fn publish(&mut self) {
        self.publish_with(self.last_error.clone());
    }

    fn publish_with(&mut self, last_error: Option<SessionError>) {
        self.sequence += 1;
        let snapshot = SessionSnapshot {
            sequence: self.sequence,
            taken_at: SystemTime::now(),
            phase: self.phase.clone(),
            last_error,
            retry: match self.phase {
                SessionPhase::Failed { .. } => self.supervisor.progress(),
                _ => None,
            },
        };
        debug!("Session snapshot: {}", snapshot.summary());
        self.hub.publish(snapshot);
    }

    /// Report a refused request from `Idle` without changing phase.
    ///
    /// The denial shows up in one snapshot only; the session's own
    /// `last_error` is left alone.
    fn reject(&mut self, err: SessionError) -> Result<ServerDescriptor, SessionError> {
        warn!("Connect refused: {}", err);
        self.publish_with(Some(err.clone()));
        Err(err)
    }

    fn handle_connect(&mut self, target: Target) -> Result<ServerDescriptor, SessionError> {
        // The live session's snapshots keep describing that session
        if !self.phase.is_idle() {
            warn!("Connect refused: session is {}", self.phase.kind());
            return Err(SessionError::SessionAlreadyActive);
        }

        // Read fresh on every connect so upgrades and expiries apply at once
        let subscription = self.subscription.current();
        let now = SystemTime::now();

        let server = match target {
            Target::Id(id) => match self.directory.by_id(&id) {
                Some(server) => server,
                None => return self.reject(SessionError::UnknownServer(id)),
            },
            Target::Fastest => match self.directory.fastest(&subscription, now) {
                Some(server) => server,
                None => return self.reject(SessionError::ServerUnavailable),
            },
        };

        if let Err(reason) = can_connect(&subscription, &server, now).into_result() {
            return self.reject(reason.into());
        }

        info!("Connecting to {} ({})", server, server.core_type);
        self.supervisor.reset();
        self.last_error = None;
        self.generation += 1;
        self.phase = SessionPhase::Connecting {
            server: server.clone(),
        };
        self.publish();
        self.spawn_open(server.clone());

        Ok(server)
    }

    fn handle_disconnect(&mut self) -> Result<(), SessionError> {
        match std::mem::replace(&mut self.phase, SessionPhase::Idle) {
            SessionPhase::Idle => Err(SessionError::NotConnected),
            SessionPhase::Connecting { server } => {
                info!("Connect to {} cancelled", server);
                self.generation += 1;
                self.last_error = None;
                self.publish();
                Ok(())
            }
            SessionPhase::Connected { server, .. } => {
                info!("Disconnecting from {}", server);
                self.generation += 1;
                self.last_error = None;
                self.phase = SessionPhase::Disconnecting { server };
                self.publish();

                if let Some(live) = self.tunnel.take() {
                    self.spawn_close(live.handle);
                } else {
                    self.phase = SessionPhase::Idle;
                    self.publish();
                }
                Ok(())
            }
            phase @ SessionPhase::Disconnecting { .. } => {
                debug!("Disconnect already in progress");
                self.phase = phase;
                Ok(())
            }
            SessionPhase::Failed { server, .. } => {
                info!("Abandoning reconnect to {}", server);
                self.generation += 1;
                self.supervisor.reset();
                self.last_error = None;
                self.publish();
                Ok(())
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Opened { generation, result } => self.on_opened(generation, result),
            Event::Reading { generation, result } => self.on_reading(generation, result),
            Event::Closed { generation, result } => self.on_closed(generation, result),
            Event::RetryDue { generation } => self.on_retry_due(generation),
        }
    }

    fn on_opened(&mut self, generation: u64, result: Result<TunnelHandle, TransportError>) {
        if generation != self.generation {
            if let Ok(handle) = result {
                warn!("Closing {} opened for an abandoned attempt", handle);
                self.spawn_orphan_close(handle);
            }
            return;
        }

        let (server, origin) = match &self.phase {
            SessionPhase::Connecting { server } => (server.clone(), FailureOrigin::Connecting),
            SessionPhase::Failed { server, .. } => (server.clone(), FailureOrigin::Retry),
            _ => {
                if let Ok(handle) = result {
                    self.spawn_orphan_close(handle);
                }
                return;
            }
        };

        match result {
            Ok(handle) => self.enter_connected(server, handle),
            Err(err) => {
                error!("Failed to connect to {}: {}", server, err);
                self.enter_failed(server, err, origin);
            }
        }
    }

    fn enter_connected(&mut self, server: ServerDescriptor, handle: TunnelHandle) {
        self.supervisor.on_connected();

        let generation = self.generation;
        let events = self.events_tx.clone();
        let meter = TrafficMeter::start(
            self.transport.clone(),
            handle,
            self.options.meter_interval,
            move |result| events.send(Event::Reading { generation, result }).is_ok(),
        );
        self.tunnel = Some(LiveTunnel {
            handle,
            _meter: meter,
        });

        info!("Connected to {} via {}", server, handle);
        self.last_error = None;
        self.phase = SessionPhase::Connected {
            server,
            started_at: SystemTime::now(),
            bytes_up: 0,
            bytes_down: 0,
        };
        self.publish();
    }

    /// Publish `Failed`, then let the supervisor decide what comes next
    fn enter_failed(&mut self, server: ServerDescriptor, err: TransportError, origin: FailureOrigin) {
        self.last_error = Some(SessionError::Transport(err.clone()));
        let decision = self.supervisor.on_failure(
            origin,
            &self.events_tx,
            Event::RetryDue {
                generation: self.generation,
            },
        );

        self.phase = SessionPhase::Failed {
            server,
            error: err.clone(),
        };
        self.publish();

        match decision {
            RetryDecision::Scheduled(_) => {}
            RetryDecision::NotRetried => {
                self.phase = SessionPhase::Idle;
                self.publish();
            }
            RetryDecision::Exhausted { attempts } => {
                error!("Giving up after {} reconnect attempt(s)", attempts);
                self.generation += 1;
                self.last_error = Some(SessionError::RetryExhausted {
                    attempts,
                    last: err,
                });
                self.phase = SessionPhase::Idle;
                self.publish();
            }
        }
    }

    fn on_reading(&mut self, generation: u64, result: Result<TrafficSample, TransportError>) {
        if generation != self.generation {
            return;
        }
        let SessionPhase::Connected {
            bytes_up,
            bytes_down,
            ..
        } = &mut self.phase
        else {
            return;
        };

        match result {
            Ok(sample) => {
                let up = sample.bytes_up.max(*bytes_up);
                let down = sample.bytes_down.max(*bytes_down);
                if (up, down) != (*bytes_up, *bytes_down) {
                    *bytes_up = up;
                    *bytes_down = down;
                    self.publish();
                }
            }
            Err(err) => self.on_transport_lost(err),
        }
    }

    fn on_transport_lost(&mut self, err: TransportError) {
        let SessionPhase::Connected { server, .. } =
            std::mem::replace(&mut self.phase, SessionPhase::Idle)
        else {
            return;
        };

        warn!("Tunnel to {} lost: {}", server, err);
        if let Some(live) = self.tunnel.take() {
            self.spawn_orphan_close(live.handle);
        }
        self.enter_failed(server, err, FailureOrigin::Lost);
    }

    fn on_closed(&mut self, generation: u64, result: Result<(), TransportError>) {
        if generation != self.generation {
            return;
        }
        if !matches!(self.phase, SessionPhase::Disconnecting { .. }) {
            return;
        }

        if let Err(err) = result {
            warn!("Transport close reported an error: {}", err);
        }
        info!("Disconnected");
        self.phase = SessionPhase::Idle;
        self.publish();
    }

    fn on_retry_due(&mut self, generation: u64) {
        if generation != self.generation {
            return;
        }
        let SessionPhase::Failed { server, .. } = &self.phase else {
            return;
        };
        let server = server.clone();

        if let Some(progress) = self.supervisor.progress() {
            info!(
                "Reconnecting to {} (attempt {}/{})",
                server, progress.attempt, progress.max_attempts
            );
        }
        self.generation += 1;
        self.spawn_open(server);
    }

    fn spawn_open(&self, server: ServerDescriptor) {
        let transport = self.transport.clone();
        let events = self.events_tx.clone();
        let generation = self.generation;
        let timeout = self.options.open_timeout;

        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, transport.open(&server)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::HandshakeTimeout),
            };
            // Actor already gone: nobody else will close this tunnel
            if let Err(mpsc::error::SendError(Event::Opened {
                result: Ok(handle), ..
            })) = events.send(Event::Opened { generation, result })
            {
                warn!("Closing {} opened after shutdown", handle);
                if let Err(err) = transport.close(handle).await {
                    debug!("Close of {} failed: {}", handle, err);
                }
            }
        });
    }

    fn spawn_close(&self, handle: TunnelHandle) {
        let transport = self.transport.clone();
        let events = self.events_tx.clone();
        let generation = self.generation;

        tokio::spawn(async move {
            let result = transport.close(handle).await;
            let _ = events.send(Event::Closed { generation, result });
        });
    }

    /// Close a tunnel nobody is waiting on
    fn spawn_orphan_close(&self, handle: TunnelHandle) {
        let transport = self.transport.clone();
        tokio::spawn(async move {
            if let Err(err) = transport.close(handle).await {
                debug!("Close of {} failed: {}", handle, err);
            }
        });
    }

    async fn teardown(&mut self, events: &mut mpsc::UnboundedReceiver<Event>) {
        self.generation += 1;
        self.supervisor.reset();

        // Refuse further completions, then settle the ones already queued
        events.close();
        while let Ok(event) = events.try_recv() {
            if let Event::Opened {
                result: Ok(handle), ..
            } = event
            {
                if let Err(err) = self.transport.close(handle).await {
                    warn!("Close during shutdown failed: {}", err);
                }
            }
        }

        if let Some(LiveTunnel { handle, _meter }) = self.tunnel.take() {
            drop(_meter);
            if let Err(err) = self.transport.close(handle).await {
                warn!("Close during shutdown failed: {}", err);
            }
        }

        if !self.phase.is_idle() {
            self.phase = SessionPhase::Idle;
            self.publish();
        }
        self.hub.close();
        info!("Session manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{ServerStatus, Tier};
    use crate::session::PhaseKind;
    use crate::simulated::SimulatedTransport;
    use crate::subscription::Subscription;
    use crate::supervisor::RetryPolicy;
    use std::time::Duration;
    use tokio::time;

    const WAIT: Duration = Duration::from_secs(120);

    fn options() -> SessionOptions {
        SessionOptions {
            meter_interval: Duration::from_secs(1),
            open_timeout: Duration::from_secs(15),
            retry: RetryPolicy::fixed(3, Duration::from_secs(1), Duration::from_secs(30)),
        }
    }

    fn setup(subscription: Subscription) -> (SessionManager, Arc<SimulatedTransport>) {
        let directory = Arc::new(ServerDirectory::new(ServerDescriptor::default_catalog()).unwrap());
        let transport = Arc::new(
            SimulatedTransport::new()
                .with_handshake(Duration::from_millis(200))
                .with_seed(42),
        );
        let manager = SessionManager::spawn(
            directory,
            Arc::new(subscription),
            transport.clone(),
            options(),
        );
        (manager, transport)
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_idle() {
        let (manager, _) = setup(Subscription::free());
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.kind(), PhaseKind::Idle);
        assert!(snapshot.server().is_none());
        assert_eq!(snapshot.sequence, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_reaches_connected_with_zero_counters() {
        let (manager, transport) = setup(Subscription::free());
        let mut updates = manager.subscribe();

        let server = manager.connect("1").await.unwrap();
        assert_eq!(server.id, "1");

        let connecting = updates
            .wait_for_within(WAIT, |s| s.kind() == PhaseKind::Connecting)
            .await
            .unwrap();
        assert_eq!(connecting.server().unwrap().id, "1");

        let connected = updates
            .wait_for_within(WAIT, |s| s.phase.is_connected())
            .await
            .unwrap();
        assert_eq!(connected.phase.traffic(), Some((0, 0)));
        assert_eq!(transport.live_handles().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_server() {
        let (manager, transport) = setup(Subscription::free());
        assert_eq!(
            manager.connect("nope").await,
            Err(SessionError::UnknownServer("nope".into()))
        );
        assert_eq!(transport.open_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_server_denied() {
        let (manager, transport) = setup(Subscription::premium_for(Duration::from_secs(3600)));

        assert_eq!(manager.connect("3").await, Err(SessionError::ServerUnavailable));
        assert_eq!(manager.connect("4").await, Err(SessionError::ServerUnavailable));
        assert_eq!(transport.open_calls(), 0);

        let snapshot = manager.snapshot();
        assert!(snapshot.phase.is_idle());
        assert_eq!(snapshot.last_error, Some(SessionError::ServerUnavailable));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_when_idle() {
        let (manager, _) = setup(Subscription::free());
        assert_eq!(manager.disconnect().await, Err(SessionError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_quick_connect_picks_fastest() {
        let directory = Arc::new(
            ServerDirectory::new(vec![
                ServerDescriptor::new("slow", "Slow").with_ping(300),
                ServerDescriptor::new("fast-premium", "Fast premium")
                    .with_ping(10)
                    .with_tier(Tier::Premium),
                ServerDescriptor::new("fast-down", "Fast offline")
                    .with_ping(5)
                    .with_status(ServerStatus::Offline),
                ServerDescriptor::new("ok", "Ok").with_ping(60),
            ])
            .unwrap(),
        );
        let transport = Arc::new(SimulatedTransport::new().with_handshake(Duration::ZERO));
        let manager = SessionManager::spawn(
            directory,
            Arc::new(Subscription::free()),
            transport.clone(),
            options(),
        );

        let server = manager.quick_connect().await.unwrap();
        assert_eq!(server.id, "ok");
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.opened_servers(), vec!["ok".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quick_connect_with_nothing_admitted() {
        let directory = Arc::new(
            ServerDirectory::new(vec![
                ServerDescriptor::new("p", "Premium only").with_tier(Tier::Premium),
            ])
            .unwrap(),
        );
        let manager = SessionManager::spawn(
            directory,
            Arc::new(Subscription::free()),
            Arc::new(SimulatedTransport::new()),
            options(),
        );

        assert_eq!(manager.quick_connect().await, Err(SessionError::ServerUnavailable));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_timeout_is_a_failure() {
        let directory = Arc::new(ServerDirectory::new(ServerDescriptor::default_catalog()).unwrap());
        let transport = Arc::new(SimulatedTransport::new().with_handshake(Duration::from_secs(60)));
        let manager = SessionManager::spawn(
            directory,
            Arc::new(Subscription::free()),
            transport.clone(),
            options(),
        );
        let mut updates = manager.subscribe();

        manager.connect("1").await.unwrap();
        let failed = updates
            .wait_for_within(WAIT, |s| s.kind() == PhaseKind::Failed)
            .await
            .unwrap();
        assert!(matches!(
            failed.phase,
            SessionPhase::Failed { error: TransportError::HandshakeTimeout, .. }
        ));

        let idle = updates
            .wait_for_within(WAIT, |s| s.phase.is_idle())
            .await
            .unwrap();
        assert_eq!(
            idle.last_error,
            Some(SessionError::Transport(TransportError::HandshakeTimeout))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_tunnel() {
        let (manager, transport) = setup(Subscription::free());
        let mut updates = manager.subscribe();

        manager.connect("1").await.unwrap();
        updates
            .wait_for_within(WAIT, |s| s.phase.is_connected())
            .await
            .unwrap();

        manager.shutdown().await;
        assert!(transport.live_handles().is_empty());
        assert!(manager.snapshot().phase.is_idle());
        assert_eq!(manager.connect("1").await, Err(SessionError::Shutdown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_streams_end_after_shutdown() {
        let (manager, _) = setup(Subscription::free());
        let mut updates = manager.subscribe();

        manager.connect("1").await.unwrap();
        manager.shutdown().await;

        let drained = tokio::time::timeout(WAIT, async {
            let mut last = None;
            while let Some(snapshot) = updates.recv().await {
                last = Some(snapshot);
            }
            last
        })
        .await
        .unwrap();
        assert!(drained.unwrap().phase.is_idle());

        let mut late = manager.subscribe();
        assert!(late.recv().await.unwrap().phase.is_idle());
        assert!(late.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_strictly_increases() {
        let (manager, _) = setup(Subscription::free());
        let mut updates = manager.subscribe();

        manager.connect("1").await.unwrap();
        updates
            .wait_for_within(WAIT, |s| s.phase.is_connected())
            .await
            .unwrap();
        time::sleep(Duration::from_secs(5)).await;
        manager.disconnect().await.unwrap();
        time::sleep(Duration::from_secs(1)).await;

        let mut last = None;
        let mut seen = 0;
        while let Some(snapshot) = updates.try_recv() {
            if let Some(prev) = last {
                assert!(snapshot.sequence > prev);
            }
            last = Some(snapshot.sequence);
            seen += 1;
        }
        assert!(seen > 2);
        assert!(manager.snapshot().phase.is_idle());
    }
}
