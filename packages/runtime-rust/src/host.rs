//! Bus assembly and lifecycle.
//!
//! [`BusBuilder`] collects configuration, the state store, the clock, and the
//! handler registrations; [`BusBuilder::start`] wires them into a running
//! [`BusHost`].

use std::sync::Arc;
use std::time::Duration;

use simplebus_core::{ClockSource, ConfigError, Message, SystemClock};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::BusConfig;
use crate::dispatch::{
    build_delivery_pipeline, DispatchEnv, HandlerRegistry, MessageRouter, StatefulContext,
};
use crate::error::BusError;
use crate::lock::DistributedLock;
use crate::storage::{MemoryStateStore, StateStore};
use crate::transport::{
    BackgroundWorker, BusHandle, HealthState, LocalBus, LocalTransport, RetryScheduler,
    ShutdownController,
};

// ---------------------------------------------------------------------------
// BusBuilder
// ---------------------------------------------------------------------------

/// Builder for a [`BusHost`].
///
/// ```rust,ignore
/// let host = BusBuilder::new(BusConfig::default())
///     .store(Arc::new(RedbStateStore::open("state.redb")?))
///     .configure(samples::publish_agent::register)?
///     .start()
///     .await?;
/// ```
pub struct BusBuilder {
    config: BusConfig,
    store: Option<Arc<dyn StateStore>>,
    clock: Arc<dyn ClockSource>,
    registry: Arc<HandlerRegistry>,
}

impl BusBuilder {
    #[must_use]
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            store: None,
            clock: Arc::new(SystemClock),
            registry: Arc::new(HandlerRegistry::new()),
        }
    }

    /// State store for saga state and leases. Defaults to a fresh
    /// [`MemoryStateStore`].
    #[must_use]
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Clock for lease expiry and record timestamps.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = clock;
        self
    }

    /// Runs a registration function against the handler registry.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] the registration raises.
    pub fn configure<F>(self, register: F) -> Result<Self, ConfigError>
    where
        F: FnOnce(&HandlerRegistry) -> Result<(), ConfigError>,
    {
        register(&self.registry)?;
        Ok(self)
    }

    /// Makes a message type decodable without registering a handler for it.
    #[must_use]
    pub fn message<M: Message>(self) -> Self {
        self.registry.message::<M>();
        self
    }

    /// The registry handlers are added to.
    #[must_use]
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Initializes the store and starts consuming.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Store`] if the store fails to initialize.
    pub async fn start(self) -> Result<BusHost, BusError> {
        let Self {
            config,
            store,
            clock,
            registry,
        } = self;

        let store = store.unwrap_or_else(|| Arc::new(MemoryStateStore::new()));
        store.initialize().await?;

        let shutdown = Arc::new(ShutdownController::new());
        let (local, inbox, scheduler) = LocalBus::channel(Arc::clone(&shutdown), &config.transport);

        let lock = DistributedLock::new(Arc::clone(&store), clock, config.lock.clone());
        let context = StatefulContext::new(DispatchEnv {
            store: Arc::clone(&store),
            lock,
            correlations: registry.correlations(),
            bus: Arc::new(local.clone()),
        });
        let router = MessageRouter::new(registry.clone(), context);

        let catalog = registry.catalog();
        info!(
            node_id = %config.node_id,
            message_types = catalog.len(),
            handled_types = registry.message_type_count(),
            sagas = registry.correlations().len(),
            "bus starting"
        );

        let transport = LocalTransport::new(
            inbox,
            build_delivery_pipeline(router.clone(), &config.transport),
            catalog,
            local.clone(),
            &config.transport,
        );
        let (stop_tx, stop_rx) = oneshot::channel();
        let span = info_span!("transport", node_id = %config.node_id);
        let transport = tokio::spawn(transport.run(stop_rx).instrument(span));

        shutdown.set_ready();

        Ok(BusHost {
            config,
            bus: BusHandle::new(Arc::new(local)),
            router,
            store,
            shutdown,
            stop: Some(stop_tx),
            transport: Some(transport),
            scheduler,
        })
    }
}

// ---------------------------------------------------------------------------
// BusHost
// ---------------------------------------------------------------------------

/// A running bus.
pub struct BusHost {
    config: BusConfig,
    bus: BusHandle,
    router: MessageRouter,
    store: Arc<dyn StateStore>,
    shutdown: Arc<ShutdownController>,
    stop: Option<oneshot::Sender<()>>,
    transport: Option<JoinHandle<()>>,
    scheduler: BackgroundWorker<RetryScheduler>,
}

impl BusHost {
    /// Sending handle for this bus.
    #[must_use]
    pub fn bus(&self) -> BusHandle {
        self.bus.clone()
    }

    /// The router the transport delivers into.
    #[must_use]
    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        self.shutdown.health_state()
    }

    /// Messages queued, scheduled for re-send, or being routed.
    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.shutdown.in_flight_count()
    }

    /// Waits until no message is in flight. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        self.shutdown.wait_idle(timeout).await
    }

    /// Drains in-flight messages, stops consuming, and closes the store.
    ///
    /// Returns whether the drain completed within the configured timeout.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Store`] if the store fails to close.
    pub async fn shutdown(mut self) -> Result<bool, BusError> {
        info!(node_id = %self.config.node_id, in_flight = self.in_flight_count(), "bus draining");
        let drained = self.shutdown.drain(self.config.transport.drain_timeout).await;
        if !drained {
            warn!(
                in_flight = self.in_flight_count(),
                "drain timed out, remaining messages dropped"
            );
        }

        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.await {
                error!(error = %e, "transport task failed");
            }
        }
        self.scheduler.stop().await;
        self.store.close().await?;

        info!(node_id = %self.config.node_id, drained, "bus stopped");
        Ok(drained)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
