//! Traffic Meter
//!
//! Polls [`TransportAdapter::sample`] on a fixed interval for one live
//! tunnel and hands each reading to a callback.
//!
//! The polling task is owned by the returned [`TrafficMeter`]: dropping it
//! cancels the task, so whoever holds the meter alongside the tunnel gets
//! cancellation on every exit path for free. The task also ends on its own
//! after the first failed sample, or when the callback returns `false`.

use crate::transport::{TrafficSample, TransportAdapter, TransportError, TunnelHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

/// Default sampling interval
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(3);

/// Handle to a running sampler; dropping it stops sampling
pub struct TrafficMeter {
    handle: TunnelHandle,
    token: CancellationToken,
    _guard: DropGuard,
}

impl TrafficMeter {
    /// Start sampling `handle` every `interval`.
    ///
    /// The first sample is taken one full interval after start. Must be
    /// called inside a tokio runtime.
    pub fn start<F>(
        transport: Arc<dyn TransportAdapter>,
        handle: TunnelHandle,
        interval: Duration,
        mut on_reading: F,
    ) -> Self
    where
        F: FnMut(Result<TrafficSample, TransportError>) -> bool + Send + 'static,
    {
        let token = CancellationToken::new();
        let cancelled = token.clone();

        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!("Traffic meter started for {} ({:?})", handle, interval);

            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        let reading = transport.sample(handle);
                        let failed = reading.is_err();
                        if !on_reading(reading) || failed {
                            break;
                        }
                    }
                }
            }

            debug!("Traffic meter stopped for {}", handle);
        });

        Self {
            handle,
            _guard: token.clone().drop_guard(),
            token,
        }
    }

    pub fn handle(&self) -> TunnelHandle {
        self.handle
    }

    /// Has the sampler been told to stop?
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}
