//! Simulated Transport
//!
//! An in-process [`TransportAdapter`] that fakes handshakes and traffic.
//! Used by the CLI demo and by the test suite.
//!
//! - `open` sleeps for the configured handshake time (tokio's clock, so
//!   paused-time tests stay deterministic), then consumes the next scripted
//!   outcome; with an empty script every open succeeds
//! - each `sample` grows the counters by a random amount
//! - [`SimulatedTransport::sever`] makes the next sample of a tunnel fail,
//!   simulating an unsolicited drop

use crate::server::{CoreType, ServerDescriptor};
use crate::transport::{TrafficSample, TransportAdapter, TransportError, TunnelHandle};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default simulated handshake time
pub const DEFAULT_HANDSHAKE: Duration = Duration::from_secs(2);

/// Upper bound of upload growth per sample
const MAX_UP_PER_SAMPLE: u64 = 50_000;
/// Upper bound of download growth per sample
const MAX_DOWN_PER_SAMPLE: u64 = 80_000;

/// Scripted result of one `open` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    Succeed,
    Fail(TransportError),
}

struct SimTunnel {
    server_id: String,
    counters: TrafficSample,
    severed: bool,
}

struct SimState {
    next_handle: u64,
    script: VecDeque<OpenOutcome>,
    tunnels: HashMap<TunnelHandle, SimTunnel>,
    open_calls: Vec<String>,
    closed: Vec<TunnelHandle>,
    rng: StdRng,
}

/// Fake tunnel backend
pub struct SimulatedTransport {
    handshake: Duration,
    cores: Vec<CoreType>,
    max_up: u64,
    max_down: u64,
    state: Mutex<SimState>,
}

impl SimulatedTransport {
    /// Create a backend speaking every core type with the default handshake
    pub fn new() -> Self {
        Self {
            handshake: DEFAULT_HANDSHAKE,
            cores: CoreType::all().to_vec(),
            max_up: MAX_UP_PER_SAMPLE,
            max_down: MAX_DOWN_PER_SAMPLE,
            state: Mutex::new(SimState {
                next_handle: 0,
                script: VecDeque::new(),
                tunnels: HashMap::new(),
                open_calls: Vec::new(),
                closed: Vec::new(),
                rng: StdRng::from_entropy(),
            }),
        }
    }

    pub fn with_handshake(mut self, handshake: Duration) -> Self {
        self.handshake = handshake;
        self
    }

    /// Restrict the protocol families this backend accepts
    pub fn with_cores(mut self, cores: &[CoreType]) -> Self {
        self.cores = cores.to_vec();
        self
    }

    /// Per-sample growth bounds (inclusive)
    pub fn with_traffic(mut self, max_up: u64, max_down: u64) -> Self {
        self.max_up = max_up;
        self.max_down = max_down;
        self
    }

    /// Deterministic traffic
    pub fn with_seed(self, seed: u64) -> Self {
        self.lock().rng = StdRng::seed_from_u64(seed);
        self
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue the outcome of a future `open`
    pub fn script_open(&self, outcome: OpenOutcome) {
        self.lock().script.push_back(outcome);
    }

    /// Make the next `count` opens fail with `error`
    pub fn fail_next_opens(&self, count: usize, error: TransportError) {
        let mut state = self.lock();
        for _ in 0..count {
            state.script.push_back(OpenOutcome::Fail(error.clone()));
        }
    }

    /// Drop a live tunnel; its next sample reports `ConnectionLost`
    pub fn sever(&self, handle: TunnelHandle) -> bool {
        match self.lock().tunnels.get_mut(&handle) {
            Some(tunnel) => {
                warn!("Simulated link to {} severed", tunnel.server_id);
                tunnel.severed = true;
                true
            }
            None => false,
        }
    }

    /// Sever every live tunnel, returns how many were cut
    pub fn sever_all(&self) -> usize {
        let mut state = self.lock();
        let mut cut = 0;
        for tunnel in state.tunnels.values_mut().filter(|t| !t.severed) {
            tunnel.severed = true;
            cut += 1;
        }
        cut
    }

    /// Number of `open` calls made so far
    pub fn open_calls(&self) -> usize {
        self.lock().open_calls.len()
    }

    /// Server ids passed to `open`, in call order
    pub fn opened_servers(&self) -> Vec<String> {
        self.lock().open_calls.clone()
    }

    /// Handles that have been closed, in close order
    pub fn closed_handles(&self) -> Vec<TunnelHandle> {
        self.lock().closed.clone()
    }

    /// Handles that are open and not yet closed
    pub fn live_handles(&self) -> Vec<TunnelHandle> {
        let mut live: Vec<_> = self.lock().tunnels.keys().copied().collect();
        live.sort();
        live
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportAdapter for SimulatedTransport {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn open(&self, server: &ServerDescriptor) -> Result<TunnelHandle, TransportError> {
        if !self.cores.contains(&server.core_type) {
            return Err(TransportError::Unsupported(server.core_type));
        }

        let outcome = {
            let mut state = self.lock();
            state.open_calls.push(server.id.clone());
            state.script.pop_front().unwrap_or(OpenOutcome::Succeed)
        };

        debug!("Simulated handshake with {} ({:?})", server, self.handshake);
        tokio::time::sleep(self.handshake).await;

        match outcome {
            OpenOutcome::Succeed => {
                let mut state = self.lock();
                state.next_handle += 1;
                let handle = TunnelHandle::new(state.next_handle);
                state.tunnels.insert(
                    handle,
                    SimTunnel {
                        server_id: server.id.clone(),
                        counters: TrafficSample::default(),
                        severed: false,
                    },
                );
                info!("Simulated {} up to {}", handle, server);
                Ok(handle)
            }
            OpenOutcome::Fail(err) => Err(err),
        }
    }

    async fn close(&self, handle: TunnelHandle) -> Result<(), TransportError> {
        let mut state = self.lock();
        match state.tunnels.remove(&handle) {
            Some(tunnel) => {
                state.closed.push(handle);
                debug!("Simulated {} to {} closed", handle, tunnel.server_id);
                Ok(())
            }
            None => Err(TransportError::UnknownHandle(handle)),
        }
    }

    fn sample(&self, handle: TunnelHandle) -> Result<TrafficSample, TransportError> {
        let mut state = self.lock();
        let (max_up, max_down) = (self.max_up, self.max_down);
        let up = state.rng.gen_range(0..=max_up);
        let down = state.rng.gen_range(0..=max_down);

        let tunnel = state
            .tunnels
            .get_mut(&handle)
            .ok_or(TransportError::UnknownHandle(handle))?;

        if tunnel.severed {
            return Err(TransportError::ConnectionLost(format!(
                "link to {} dropped",
                tunnel.server_id
            )));
        }

        tunnel.counters.bytes_up += up;
        tunnel.counters.bytes_down += down;
        Ok(tunnel.counters)
    }
}
