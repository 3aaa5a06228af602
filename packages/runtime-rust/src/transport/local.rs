//! In-process transport.
//!
//! [`LocalBus`] is the sending side: envelopes are framed as bytes and put on
//! an unbounded queue standing in for the broker. [`LocalTransport`] is the
//! consuming side: every delivery is decoded through the [`MessageCatalog`]
//! and routed through the delivery pipeline on its own task.
//!
//! Delivery is at-least-once. A delivery rejected by the prefetch bound is
//! redelivered after a back-off. Store and configuration failures are logged
//! and the delivery is acknowledged.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use simplebus_core::{AnyMessage, CodecError, Envelope, MessageCatalog};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

use super::bus::ServiceBus;
use super::retry::{RetryScheduler, ScheduledResend};
use super::shutdown::{InFlightGuard, ShutdownController};
use super::worker::{BackgroundWorker, WorkerHandle};
use crate::config::TransportConfig;
use crate::dispatch::{Delivery, DeliveryPipeline};
use crate::error::BusError;

// ---------------------------------------------------------------------------
// QueuedDelivery
// ---------------------------------------------------------------------------

/// A framed envelope waiting on the inbound queue.
///
/// Holds an [`InFlightGuard`] from the moment it is sent until it has been
/// settled or dropped.
#[derive(Debug)]
pub struct QueuedDelivery {
    delivery_id: u64,
    bytes: Vec<u8>,
    attempt: u32,
    _guard: InFlightGuard,
}

impl QueuedDelivery {
    pub(crate) fn new(delivery_id: u64, bytes: Vec<u8>, attempt: u32, guard: InFlightGuard) -> Self {
        Self {
            delivery_id,
            bytes,
            attempt,
            _guard: guard,
        }
    }

    #[must_use]
    pub fn delivery_id(&self) -> u64 {
        self.delivery_id
    }

    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    fn redelivery(self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self
        }
    }
}

// ---------------------------------------------------------------------------
// LocalBus
// ---------------------------------------------------------------------------

/// Sending side of the in-process transport.
#[derive(Clone)]
pub struct LocalBus {
    inner: Arc<LocalBusInner>,
}

struct LocalBusInner {
    queue: mpsc::UnboundedSender<QueuedDelivery>,
    retries: WorkerHandle<ScheduledResend>,
    shutdown: Arc<ShutdownController>,
    next_id: AtomicU64,
}

/// Receiving end of the inbound queue, consumed by [`LocalTransport`].
pub struct LocalInbox {
    rx: mpsc::UnboundedReceiver<QueuedDelivery>,
}

impl LocalBus {
    /// Creates the queue, its sending side, and the retry scheduler that
    /// feeds delayed re-sends back into it.
    #[must_use]
    pub fn channel(
        shutdown: Arc<ShutdownController>,
        config: &TransportConfig,
    ) -> (Self, LocalInbox, BackgroundWorker<RetryScheduler>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = BackgroundWorker::start(RetryScheduler::new(tx.clone()), config.retry_tick);
        let bus = Self {
            inner: Arc::new(LocalBusInner {
                queue: tx,
                retries: scheduler.handle(),
                shutdown,
                next_id: AtomicU64::new(1),
            }),
        };
        (bus, LocalInbox { rx }, scheduler)
    }

    fn queue(&self, envelope: &Envelope) -> Result<QueuedDelivery, BusError> {
        let bytes = envelope.to_bytes()?;
        let delivery_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(QueuedDelivery::new(
            delivery_id,
            bytes,
            1,
            self.inner.shutdown.in_flight_guard(),
        ))
    }

    fn enqueue(&self, delivery: QueuedDelivery) -> Result<(), BusError> {
        self.inner
            .queue
            .send(delivery)
            .map_err(|_| BusError::TransportClosed)
    }

    async fn schedule(&self, delivery: QueuedDelivery, delay: Duration) -> Result<(), BusError> {
        self.inner
            .retries
            .submit(ScheduledResend {
                due: Instant::now() + delay,
                delivery,
            })
            .await
            .map_err(|_| BusError::TransportClosed)
    }
}

#[async_trait]
impl ServiceBus for LocalBus {
    async fn send(&self, envelope: Envelope) -> Result<(), BusError> {
        let delivery = self.queue(&envelope)?;
        debug!(
            message_type = %envelope.message_type,
            delivery_id = delivery.delivery_id,
            "message sent"
        );
        self.enqueue(delivery)
    }

    async fn retry(&self, envelope: Envelope, delay: Duration) -> Result<(), BusError> {
        let delivery = self.queue(&envelope)?;
        debug!(
            message_type = %envelope.message_type,
            delivery_id = delivery.delivery_id,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "message scheduled for re-send"
        );
        self.schedule(delivery, delay).await
    }
}

// ---------------------------------------------------------------------------
// LocalTransport
// ---------------------------------------------------------------------------

/// Consuming side of the in-process transport.
pub struct LocalTransport {
    inbox: LocalInbox,
    pipeline: DeliveryPipeline,
    catalog: Arc<MessageCatalog>,
    bus: LocalBus,
    overload_backoff: Duration,
}

impl LocalTransport {
    #[must_use]
    pub fn new(
        inbox: LocalInbox,
        pipeline: DeliveryPipeline,
        catalog: MessageCatalog,
        bus: LocalBus,
        config: &TransportConfig,
    ) -> Self {
        Self {
            inbox,
            pipeline,
            catalog: Arc::new(catalog),
            bus,
            overload_backoff: config.overload_backoff,
        }
    }

    /// Consumes the inbound queue until `stop` fires or every sender is gone.
    ///
    /// Deliveries still queued when the loop ends are dropped.
    pub async fn run(mut self, mut stop: oneshot::Receiver<()>) {
        info!(message_types = self.catalog.len(), "local transport consuming");
        loop {
            tokio::select! {
                biased;
                _ = &mut stop => break,
                next = self.inbox.rx.recv() => match next {
                    Some(queued) => self.dispatch(queued),
                    None => break,
                },
            }
        }
        self.inbox.rx.close();
        let mut dropped = 0_usize;
        while self.inbox.rx.try_recv().is_ok() {
            dropped += 1;
        }
        info!(dropped, "local transport stopped");
    }

    fn dispatch(&self, queued: QueuedDelivery) {
        let pipeline = self.pipeline.clone();
        let catalog = Arc::clone(&self.catalog);
        let bus = self.bus.clone();
        let backoff = self.overload_backoff;
        tokio::spawn(settle(queued, pipeline, catalog, bus, backoff));
    }
}

/// Decodes, routes, and acknowledges or redelivers one delivery.
async fn settle(
    queued: QueuedDelivery,
    pipeline: DeliveryPipeline,
    catalog: Arc<MessageCatalog>,
    bus: LocalBus,
    backoff: Duration,
) {
    let delivery_id = queued.delivery_id;
    let opened = Envelope::from_bytes(&queued.bytes).and_then(|envelope| catalog.open(&envelope));
    let message: Arc<dyn AnyMessage> = match opened {
        Ok(message) => Arc::from(message),
        Err(CodecError::UnknownMessageType { message_type }) => {
            debug!(delivery_id, %message_type, "no handler registered, message dropped");
            return;
        }
        Err(e) => {
            error!(delivery_id, error = %e, "unable to open message envelope, message dropped");
            return;
        }
    };

    let delivery = Delivery {
        message,
        delivery_id,
        attempt: queued.attempt,
    };
    match pipeline.oneshot(delivery).await {
        Ok(report) => {
            debug!(
                delivery_id,
                matched = report.matched,
                handler_failures = report.handler_failures,
                completed = report.completed,
                "delivery acknowledged"
            );
        }
        Err(BusError::Overloaded) => {
            let attempt = queued.attempt;
            if let Err(e) = bus.schedule(queued.redelivery(), backoff).await {
                warn!(delivery_id, attempt, error = %e, "overloaded delivery could not be redelivered");
            }
        }
        Err(e) if e.is_configuration() => {
            error!(delivery_id, error = %e, "configuration error, delivery acknowledged");
        }
        Err(e) => {
            error!(delivery_id, error = %e, "delivery failed, acknowledged");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use serde::{Deserialize, Serialize};
    use simplebus_core::{Handle, Handler, Message, Outbox};

    use super::*;
    use crate::dispatch::context::tests::fixture;
    use crate::dispatch::{build_delivery_pipeline, HandlerRegistry, MessageRouter, StatefulContext};
    use crate::transport::BusHandle;

    #[derive(Serialize, Deserialize)]
    struct Knock {
        n: u32,
    }

    impl Message for Knock {
        const MESSAGE_TYPE: &'static str = "local.knock";
    }

    #[derive(Serialize, Deserialize)]
    struct Stray;

    impl Message for Stray {
        const MESSAGE_TYPE: &'static str = "local.stray";
    }

    /// Echoes each knock back once, as a retry, until `n` reaches zero.
    #[derive(Clone)]
    struct Echo(Arc<AtomicU32>);

    impl Handler for Echo {}

    #[async_trait]
    impl Handle<Knock> for Echo {
        async fn handle(&mut self, message: &Knock, bus: &mut Outbox) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            if message.n > 0 {
                bus.retry(&Knock { n: message.n - 1 }, Duration::from_millis(200))?;
            }
            Ok(())
        }
    }

    struct Running {
        bus: BusHandle,
        shutdown: Arc<ShutdownController>,
        seen: Arc<AtomicU32>,
        stop: oneshot::Sender<()>,
        task: tokio::task::JoinHandle<()>,
        scheduler: BackgroundWorker<RetryScheduler>,
    }

    fn start() -> Running {
        let f = fixture();
        let seen = Arc::new(AtomicU32::new(0));
        let registry = Arc::new(HandlerRegistry::new());
        let echo = Echo(Arc::clone(&seen));
        registry
            .handler(move || echo.clone())
            .handles::<Knock>()
            .unwrap();

        let config = TransportConfig {
            retry_tick: Duration::from_millis(10),
            ..TransportConfig::default()
        };
        let shutdown = Arc::new(ShutdownController::new());
        let (local, inbox, scheduler) = LocalBus::channel(Arc::clone(&shutdown), &config);

        let mut env = f.context.env().clone();
        env.bus = Arc::new(local.clone());
        let router = MessageRouter::new(registry.clone(), StatefulContext::new(env));
        let transport = LocalTransport::new(
            inbox,
            build_delivery_pipeline(router, &config),
            registry.catalog(),
            local.clone(),
            &config,
        );
        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(transport.run(stop_rx));
        Running {
            bus: BusHandle::new(Arc::new(local)),
            shutdown,
            seen,
            stop,
            task,
            scheduler,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_resends_are_delivered_and_tracked() {
        let mut running = start();

        running.bus.send(&Knock { n: 2 }).await.unwrap();
        assert!(running.shutdown.in_flight_count() >= 1);
        assert!(running.shutdown.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(running.seen.load(Ordering::SeqCst), 3);

        running.stop.send(()).unwrap();
        running.task.await.unwrap();
        running.scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_message_types_are_dropped() {
        let mut running = start();

        running.bus.send(&Stray).await.unwrap();
        assert!(running.shutdown.wait_idle(Duration::from_secs(1)).await);
        assert_eq!(running.seen.load(Ordering::SeqCst), 0);

        running.stop.send(()).unwrap();
        running.task.await.unwrap();
        running.scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn send_after_stop_reports_closed_transport() {
        let mut running = start();

        running.stop.send(()).unwrap();
        running.task.await.unwrap();
        running.scheduler.stop().await;

        let err = running.bus.send(&Knock { n: 0 }).await.unwrap_err();
        assert!(matches!(err, BusError::TransportClosed));
        assert_eq!(running.shutdown.in_flight_count(), 0);
    }
}
