//! Delayed re-sends.
//!
//! A handler's `Outbox::retry` and the transport's overload redelivery both
//! end up here: the delivery is parked until it is due and then pushed back
//! onto the inbound queue.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::local::QueuedDelivery;
use super::worker::BackgroundRunnable;

/// A delivery to be re-queued once `due` has passed.
#[derive(Debug)]
pub struct ScheduledResend {
    pub due: Instant,
    pub delivery: QueuedDelivery,
}

/// Parks delayed deliveries and releases them on each worker tick.
pub struct RetryScheduler {
    outlet: mpsc::UnboundedSender<QueuedDelivery>,
    /// Keyed by due time, then arrival order.
    pending: BTreeMap<(Instant, u64), QueuedDelivery>,
    seq: u64,
}

impl RetryScheduler {
    #[must_use]
    pub fn new(outlet: mpsc::UnboundedSender<QueuedDelivery>) -> Self {
        Self {
            outlet,
            pending: BTreeMap::new(),
            seq: 0,
        }
    }

    /// Number of parked deliveries.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn release_due(&mut self, now: Instant) -> usize {
        let mut released = 0;
        while let Some(entry) = self.pending.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let delivery = entry.remove();
            let delivery_id = delivery.delivery_id();
            if self.outlet.send(delivery).is_err() {
                debug!(delivery_id, "inbound queue closed, re-send dropped");
                continue;
            }
            released += 1;
        }
        released
    }
}

#[async_trait]
impl BackgroundRunnable for RetryScheduler {
    type Task = ScheduledResend;
    const NAME: &'static str = "retry-scheduler";

    async fn run(&mut self, task: ScheduledResend) {
        self.seq += 1;
        debug!(
            delivery_id = task.delivery.delivery_id(),
            attempt = task.delivery.attempt(),
            "re-send scheduled"
        );
        self.pending.insert((task.due, self.seq), task.delivery);
    }

    async fn on_tick(&mut self) {
        let released = self.release_due(Instant::now());
        if released > 0 {
            debug!(released, pending = self.pending.len(), "due re-sends released");
        }
    }

    async fn shutdown(&mut self) {
        if !self.pending.is_empty() {
            warn!(dropped = self.pending.len(), "scheduler stopped with re-sends still pending");
            self.pending.clear();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::transport::shutdown::ShutdownController;
    use crate::transport::worker::BackgroundWorker;

    fn queued(controller: &ShutdownController, delivery_id: u64) -> QueuedDelivery {
        QueuedDelivery::new(delivery_id, vec![0x90], 1, controller.in_flight_guard())
    }

    #[tokio::test(start_paused = true)]
    async fn releases_in_due_order() {
        let controller = ShutdownController::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = RetryScheduler::new(tx);
        let now = Instant::now();

        scheduler
            .run(ScheduledResend {
                due: now + Duration::from_secs(2),
                delivery: queued(&controller, 1),
            })
            .await;
        scheduler
            .run(ScheduledResend {
                due: now + Duration::from_secs(1),
                delivery: queued(&controller, 2),
            })
            .await;

        assert_eq!(scheduler.release_due(now), 0);
        assert_eq!(scheduler.release_due(now + Duration::from_secs(1)), 1);
        assert_eq!(rx.recv().await.unwrap().delivery_id(), 2);
        assert_eq!(scheduler.release_due(now + Duration::from_secs(5)), 1);
        assert_eq!(rx.recv().await.unwrap().delivery_id(), 1);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn parked_deliveries_hold_their_in_flight_guard() {
        let controller = Arc::new(ShutdownController::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut worker = BackgroundWorker::start(RetryScheduler::new(tx), Duration::from_millis(50));

        worker
            .submit(ScheduledResend {
                due: Instant::now() + Duration::from_millis(200),
                delivery: queued(&controller, 9),
            })
            .await
            .unwrap();
        assert_eq!(controller.in_flight_count(), 1);

        let released = rx.recv().await.unwrap();
        assert_eq!(released.delivery_id(), 9);
        assert_eq!(controller.in_flight_count(), 1);

        drop(released);
        assert_eq!(controller.in_flight_count(), 0);
        worker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drops_pending_and_their_guards() {
        let controller = ShutdownController::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut worker = BackgroundWorker::start(RetryScheduler::new(tx), Duration::from_millis(50));

        worker
            .submit(ScheduledResend {
                due: Instant::now() + Duration::from_secs(60),
                delivery: queued(&controller, 3),
            })
            .await
            .unwrap();
        tokio::task::yield_now().await;
        worker.stop().await;

        assert_eq!(controller.in_flight_count(), 0);
    }
}
