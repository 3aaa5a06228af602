//! Type-erased bridges from a routed message to a concrete handler call.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use simplebus_core::{downcast_message, AnyMessage, CodecError, Handle, Message, Saga};

use super::context::{Invocation, StatefulContext};
use crate::error::BusError;

/// Creates a fresh handler instance per invocation.
pub type Factory<H> = Arc<dyn Fn() -> H + Send + Sync>;

/// One registered `(handler type, message type)` pair.
#[async_trait]
pub trait Invoker: Send + Sync {
    /// Type name of the handler.
    fn handler_name(&self) -> &'static str;

    /// Saga type, if the handler carries state.
    fn saga_type(&self) -> Option<&'static str>;

    /// Runs one invocation for `message`.
    async fn invoke(
        &self,
        message: &dyn AnyMessage,
        context: &StatefulContext,
    ) -> Result<Invocation, BusError>;
}

fn expect_message<M: Message>(message: &dyn AnyMessage) -> Result<&M, BusError> {
    downcast_message::<M>(message).ok_or_else(|| {
        BusError::Codec(CodecError::TypeMismatch {
            expected: M::MESSAGE_TYPE,
            actual: message.message_type().to_string(),
        })
    })
}

/// Invoker for a handler without state.
pub struct StatelessInvoker<H, M> {
    factory: Factory<H>,
    _message: PhantomData<fn() -> M>,
}

impl<H, M> StatelessInvoker<H, M> {
    #[must_use]
    pub fn new(factory: Factory<H>) -> Self {
        Self {
            factory,
            _message: PhantomData,
        }
    }
}

#[async_trait]
impl<H, M> Invoker for StatelessInvoker<H, M>
where
    H: Handle<M>,
    M: Message,
{
    fn handler_name(&self) -> &'static str {
        std::any::type_name::<H>()
    }

    fn saga_type(&self) -> Option<&'static str> {
        None
    }

    async fn invoke(
        &self,
        message: &dyn AnyMessage,
        context: &StatefulContext,
    ) -> Result<Invocation, BusError> {
        let message = expect_message::<M>(message)?;
        context.run_stateless((self.factory)(), message).await
    }
}

/// Invoker for a saga.
pub struct SagaInvoker<S, M> {
    factory: Factory<S>,
    _message: PhantomData<fn() -> M>,
}

impl<S, M> SagaInvoker<S, M> {
    #[must_use]
    pub fn new(factory: Factory<S>) -> Self {
        Self {
            factory,
            _message: PhantomData,
        }
    }
}

#[async_trait]
impl<S, M> Invoker for SagaInvoker<S, M>
where
    S: Saga + Handle<M>,
    M: Message,
{
    fn handler_name(&self) -> &'static str {
        std::any::type_name::<S>()
    }

    fn saga_type(&self) -> Option<&'static str> {
        Some(S::SAGA_TYPE)
    }

    async fn invoke(
        &self,
        message: &dyn AnyMessage,
        context: &StatefulContext,
    ) -> Result<Invocation, BusError> {
        let message = expect_message::<M>(message)?;
        context.run_saga((self.factory)(), message).await
    }
}
