//! Static registration table of handlers, sagas, and preview hooks.
//!
//! Each registration records, under the handled message type, a type-erased
//! [`Invoker`] built from a factory closure. Sagas additionally register
//! their correlation map with the shared [`CorrelationRegistry`], and every
//! handled message type is added to the [`MessageCatalog`] the transport
//! decodes with.

use std::any::TypeId;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use simplebus_core::{
    ConfigError, CorrelationMap, Handle, Message, MessageCatalog, MessagePreview, Saga,
};
use tracing::debug;

use super::correlation::CorrelationRegistry;
use super::invoker::{Factory, Invoker, SagaInvoker, StatelessInvoker};

// ---------------------------------------------------------------------------
// HandlerProvider trait
// ---------------------------------------------------------------------------

/// Handler resolution consumed by the router.
pub trait HandlerProvider: Send + Sync {
    /// Every registered invoker for exactly `message_type`, in registration
    /// order.
    fn resolve(&self, message_type: &str) -> Vec<Arc<dyn Invoker>>;

    /// Hooks that observe every routed message.
    fn previews(&self) -> Vec<Arc<dyn MessagePreview>>;
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

/// Registration table built at process start.
///
/// ```rust,ignore
/// let registry = HandlerRegistry::new();
/// registry
///     .saga(PublishAgentWorkflow::default)?
///     .handles::<PublishAgent>()?
///     .handles::<CorpusCreated>()?;
/// registry.handler(CreateCorpusTask::default).handles::<CreateCorpus>()?;
/// ```
pub struct HandlerRegistry {
    /// Message type -> invokers, in registration order.
    by_message: DashMap<&'static str, Vec<Arc<dyn Invoker>>>,
    /// (handler `TypeId`, message type) pairs already registered.
    by_type: DashMap<(TypeId, &'static str), &'static str>,
    correlations: Arc<CorrelationRegistry>,
    catalog: RwLock<MessageCatalog>,
    previews: RwLock<Vec<Arc<dyn MessagePreview>>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_message: DashMap::new(),
            by_type: DashMap::new(),
            correlations: Arc::new(CorrelationRegistry::new()),
            catalog: RwLock::new(MessageCatalog::new()),
            previews: RwLock::new(Vec::new()),
        }
    }

    /// Starts registering a stateless handler type.
    pub fn handler<H, F>(&self, factory: F) -> HandlerRegistration<'_, H>
    where
        H: Send + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        HandlerRegistration {
            registry: self,
            factory: Arc::new(factory),
        }
    }

    /// Starts registering a saga type and builds its correlation map.
    ///
    /// # Errors
    ///
    /// Returns the [`ConfigError`] from building the map.
    pub fn saga<S, F>(&self, factory: F) -> Result<SagaRegistration<'_, S>, ConfigError>
    where
        S: Saga,
        F: Fn() -> S + Send + Sync + 'static,
    {
        let map = self.correlations.register::<S>()?;
        debug!(saga = S::SAGA_TYPE, mappings = map.len(), "saga registered");
        Ok(SagaRegistration {
            registry: self,
            factory: Arc::new(factory),
            map,
        })
    }

    /// Adds a hook that sees every routed message before handlers run.
    pub fn preview<P: MessagePreview + 'static>(&self, hook: P) -> &Self {
        self.previews.write().push(Arc::new(hook));
        self
    }

    /// Makes a message type decodable without registering a handler for it.
    pub fn message<M: Message>(&self) -> &Self {
        self.catalog.write().register::<M>();
        self
    }

    /// Shared correlation maps of all registered sagas.
    #[must_use]
    pub fn correlations(&self) -> Arc<CorrelationRegistry> {
        Arc::clone(&self.correlations)
    }

    /// Snapshot of the decoders for every registered message type.
    #[must_use]
    pub fn catalog(&self) -> MessageCatalog {
        self.catalog.read().clone()
    }

    /// Number of message types with at least one handler.
    #[must_use]
    pub fn message_type_count(&self) -> usize {
        self.by_message.len()
    }

    fn insert<M: Message>(
        &self,
        handler_type: TypeId,
        handler_name: &'static str,
        invoker: Arc<dyn Invoker>,
    ) -> Result<(), ConfigError> {
        let slot = (handler_type, M::MESSAGE_TYPE);
        if self.by_type.insert(slot, handler_name).is_some() {
            return Err(ConfigError::AmbiguousHandler {
                handler: handler_name,
                message_type: M::MESSAGE_TYPE,
            });
        }
        self.by_message
            .entry(M::MESSAGE_TYPE)
            .or_default()
            .push(invoker);
        self.catalog.write().register::<M>();
        debug!(handler = handler_name, message_type = M::MESSAGE_TYPE, "handler registered");
        Ok(())
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerProvider for HandlerRegistry {
    fn resolve(&self, message_type: &str) -> Vec<Arc<dyn Invoker>> {
        self.by_message
            .get(message_type)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    fn previews(&self) -> Vec<Arc<dyn MessagePreview>> {
        self.previews.read().clone()
    }
}

// ---------------------------------------------------------------------------
// Registration builders
// ---------------------------------------------------------------------------

/// Declares the message types a stateless handler handles.
pub struct HandlerRegistration<'a, H> {
    registry: &'a HandlerRegistry,
    factory: Factory<H>,
}

impl<H: Send + 'static> HandlerRegistration<'_, H> {
    /// Routes `M` to this handler.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::AmbiguousHandler`] if `H` already handles `M`.
    pub fn handles<M: Message>(self) -> Result<Self, ConfigError>
    where
        H: Handle<M>,
    {
        let invoker = StatelessInvoker::<H, M>::new(Arc::clone(&self.factory));
        self.registry.insert::<M>(
            TypeId::of::<H>(),
            std::any::type_name::<H>(),
            Arc::new(invoker),
        )?;
        Ok(self)
    }
}

/// Declares the message types a saga handles.
pub struct SagaRegistration<'a, S> {
    registry: &'a HandlerRegistry,
    factory: Factory<S>,
    map: Arc<CorrelationMap>,
}

impl<S: Saga> SagaRegistration<'_, S> {
    /// Routes `M` to this saga.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::MissingMapping`] if the saga declared no mapping for `M`
    /// - [`ConfigError::AmbiguousHandler`] if the saga already handles `M`
    pub fn handles<M: Message>(self) -> Result<Self, ConfigError>
    where
        S: Handle<M>,
    {
        if self.map.entry(M::MESSAGE_TYPE).is_none() {
            return Err(ConfigError::MissingMapping {
                saga_type: S::SAGA_TYPE,
                message_type: M::MESSAGE_TYPE,
            });
        }
        let invoker = SagaInvoker::<S, M>::new(Arc::clone(&self.factory));
        self.registry.insert::<M>(
            TypeId::of::<S>(),
            std::any::type_name::<S>(),
            Arc::new(invoker),
        )?;
        Ok(self)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
