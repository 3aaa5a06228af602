//! `simplebus` core: message model, envelopes, handler and saga traits, and
//! correlation mapping.
//!
//! Everything here is transport- and storage-agnostic; the runtime crate
//! drives these types against a state store and a bus.

pub mod clock;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod mapping;
pub mod message;
pub mod saga;
pub mod types;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use envelope::{Envelope, MessageCatalog};
pub use error::{CodecError, ConfigError, StateSlotEmpty};
pub use handler::{Dispatch, Handle, HandleAnyError, Handler, MessagePreview, Outbox};
pub use mapping::{CorrelationKey, CorrelationMap, MappingEntry, StateMapper};
pub use message::{downcast_message, AnyMessage, Message};
pub use saga::{Saga, SagaData, SagaState, StartedBy};
pub use types::CorrelationValue;
