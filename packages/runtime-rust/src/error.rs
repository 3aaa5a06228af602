//! Runtime error taxonomy.
//!
//! Handler failures never appear here: the invocation context catches them.
//! What remains are configuration defects, materialization failures, store
//! faults, and transport-level rejections.

use simplebus_core::{CodecError, ConfigError, CorrelationKey};

/// Errors surfaced by routing, invocation, and the transport boundary.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Invalid registration detected at startup.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A message reached a saga that has no mapping entry for it.
    #[error("saga `{saga_type}` has no mapping data for message `{message_type}`")]
    MissingMapping {
        saga_type: &'static str,
        message_type: &'static str,
    },

    /// No state exists for the correlation value and the message may not
    /// start the saga.
    #[error("saga `{saga_type}` cannot be materialized from `{message_type}` ({key})")]
    CannotMaterialize {
        saga_type: &'static str,
        message_type: &'static str,
        key: CorrelationKey,
    },

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The state store failed or returned inconsistent data.
    #[error("state store error: {0}")]
    Store(#[from] anyhow::Error),

    /// The lease expired and was reclaimed before the state was saved; the
    /// save was rejected.
    #[error("lease on resource {resource} was lost before the state could be saved")]
    LeaseLost { resource: String },

    /// The delivery pipeline is at capacity.
    #[error("bus overloaded, try again later")]
    Overloaded,

    /// The transport is not accepting messages.
    #[error("transport closed")]
    TransportClosed,
}

impl BusError {
    /// Whether this error is a configuration defect rather than a runtime
    /// fault. Configuration errors are not retried.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Config(_) | Self::MissingMapping { .. })
    }
}
