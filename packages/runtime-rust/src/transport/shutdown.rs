//! Health state and in-flight accounting for draining the bus.
//!
//! Every delivery the transport owns carries an [`InFlightGuard`]: while it
//! sits on the inbound queue, while it is parked for a re-send, and while it
//! is being routed. Dropping the last guard wakes everyone waiting for the
//! bus to go idle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Lifecycle of a bus host: Starting -> Ready -> Draining -> Stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Store and transport are being set up.
    Starting,
    /// The transport consumes deliveries.
    Ready,
    /// Shutdown began; owned deliveries are being settled.
    Draining,
    /// Every owned delivery was settled.
    Stopped,
}

#[derive(Debug, Default)]
struct InFlight {
    count: AtomicU64,
    idle: Notify,
}

/// Tracks owned deliveries and the host's health.
#[derive(Debug)]
pub struct ShutdownController {
    in_flight: Arc<InFlight>,
    state: ArcSwap<HealthState>,
}

impl ShutdownController {
    /// A controller in the `Starting` state with nothing in flight.
    #[must_use]
    pub fn new() -> Self {
        Self {
            in_flight: Arc::default(),
            state: ArcSwap::from_pointee(HealthState::Starting),
        }
    }

    pub fn set_ready(&self) {
        self.state.store(Arc::new(HealthState::Ready));
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.state.load()
    }

    /// Marks one more delivery as owned by the transport until the guard
    /// drops.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Waits until no delivery is owned, up to `timeout`. Returns whether the
    /// bus went idle. The health state is left as it is.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            // Registered before the check so a concurrent last drop is seen.
            let idle = self.in_flight.idle.notified();
            if self.in_flight_count() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                return self.in_flight_count() == 0;
            }
        }
    }

    /// Moves to `Draining` and waits up to `timeout` for owned deliveries to
    /// settle. On success the state becomes `Stopped`; on timeout it stays
    /// `Draining`.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.state.store(Arc::new(HealthState::Draining));
        let drained = self.wait_idle(timeout).await;
        if drained {
            self.state.store(Arc::new(HealthState::Stopped));
        }
        drained
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Ownership token of one delivery.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.in_flight.idle.notify_waiters();
        }
    }
}
