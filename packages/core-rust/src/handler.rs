//! Handler capabilities and the per-invocation outbox.

use std::time::Duration;

use async_trait::async_trait;

use crate::envelope::Envelope;
use crate::error::CodecError;
use crate::message::{AnyMessage, Message};

/// Base capability of every registered handler type.
///
/// A fresh handler instance is created for each invocation, so handler state
/// that must outlive one message belongs in a saga's state, not in fields.
pub trait Handler: Send + 'static {
    /// Optional failure hook.
    ///
    /// Handlers that want to observe their own failures return `Some(self)`;
    /// failures of handlers returning `None` are logged and discarded.
    fn error_hook(&mut self) -> Option<&mut dyn HandleAnyError> {
        None
    }
}

/// Processing logic for one message type.
#[async_trait]
pub trait Handle<M: Message>: Handler {
    /// Handles `message`. Messages to emit are queued on `bus`.
    ///
    /// Errors are caught by the invocation context: they are logged, offered
    /// to [`Handler::error_hook`], and never reach the router or transport.
    async fn handle(&mut self, message: &M, bus: &mut Outbox) -> anyhow::Result<()>;
}

/// Receives failures of the handler that implements it.
pub trait HandleAnyError: Send {
    /// Called after `handle` returned an error or panicked.
    fn on_handler_error(&mut self, message: &dyn AnyMessage, error: &anyhow::Error);
}

/// Observes every inbound message before handler resolution.
pub trait MessagePreview: Send + Sync {
    /// Called once per routed message, before any handler runs.
    fn peek(&self, message: &dyn AnyMessage);
}

/// Outbound instruction produced by handler logic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Send immediately.
    Send(Envelope),
    /// Re-send after `delay`. The delay is honored by the transport's
    /// sender path, never by sleeping inside the handler.
    Retry { envelope: Envelope, delay: Duration },
}

/// Collects the messages a handler emits during one invocation.
///
/// The invocation context flushes the outbox to the bus after the saga state
/// has been persisted and its lock released.
#[derive(Debug, Default)]
pub struct Outbox {
    pending: Vec<Dispatch>,
}

impl Outbox {
    /// Creates an empty outbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `message` for sending.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if the message cannot be serialized.
    pub fn send<M: Message>(&mut self, message: &M) -> Result<(), CodecError> {
        self.pending.push(Dispatch::Send(Envelope::enclose(message)?));
        Ok(())
    }

    /// Queues `message` for re-delivery after `delay`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if the message cannot be serialized.
    pub fn retry<M: Message>(&mut self, message: &M, delay: Duration) -> Result<(), CodecError> {
        self.pending.push(Dispatch::Retry {
            envelope: Envelope::enclose(message)?,
            delay,
        });
        Ok(())
    }

    /// Number of queued instructions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing has been queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Queued instructions, in the order they were issued.
    #[must_use]
    pub fn pending(&self) -> &[Dispatch] {
        &self.pending
    }

    /// Takes all queued instructions, leaving the outbox empty.
    pub fn drain(&mut self) -> Vec<Dispatch> {
        std::mem::take(&mut self.pending)
    }
}
