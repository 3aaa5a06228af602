//! Correlation mapping model and the state document codec.
//!
//! A saga declares, per handled message type, which message field carries
//! the correlation value and which field of its state that value binds to:
//!
//! ```rust,ignore
//! fn configure_mapping(mapper: &mut StateMapper<Self>) {
//!     mapper
//!         .start_with::<ImportEvaluatorData>("import_id", "import_id")
//!         .map::<Table1Staged>("import_id", "import_id");
//! }
//! ```
//!
//! [`CorrelationMap::build`] runs that routine once and freezes the result.
//! State travels between the store and the saga as a JSON document; the
//! helpers at the bottom of this module are the per-saga codec.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::marker::PhantomData;

use serde::Deserialize;

use crate::error::{CodecError, ConfigError};
use crate::handler::Handle;
use crate::message::{AnyMessage, Message};
use crate::saga::{Saga, SagaState, StartedBy};
use crate::types::CorrelationValue;

/// `message field → state field` binding for one message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingEntry {
    pub message_field: String,
    pub state_field: String,
}

/// Collects a saga's mapping declarations.
///
/// Handed to [`Saga::configure_mapping`]. Duplicate declarations are kept
/// and rejected by [`CorrelationMap::build`].
pub struct StateMapper<S> {
    entries: Vec<(&'static str, MappingEntry)>,
    starters: BTreeSet<&'static str>,
    _saga: PhantomData<fn() -> S>,
}

impl<S: Saga> StateMapper<S> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            starters: BTreeSet::new(),
            _saga: PhantomData,
        }
    }

    /// Binds `M.message_field` to `State.state_field`.
    pub fn map<M: Message>(&mut self, message_field: &str, state_field: &str) -> &mut Self
    where
        S: Handle<M>,
    {
        self.entries.push((
            M::MESSAGE_TYPE,
            MappingEntry {
                message_field: message_field.to_string(),
                state_field: state_field.to_string(),
            },
        ));
        self
    }

    /// Like [`StateMapper::map`], and declares `M` a start trigger.
    pub fn start_with<M: Message>(&mut self, message_field: &str, state_field: &str) -> &mut Self
    where
        S: StartedBy<M>,
    {
        self.starters.insert(M::MESSAGE_TYPE);
        self.map::<M>(message_field, state_field)
    }
}

/// Frozen correlation mapping of one saga type.
///
/// Keyed by message type in a `BTreeMap`, so iteration order (and therefore
/// equality between two builds) is deterministic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationMap {
    saga_type: &'static str,
    entries: BTreeMap<&'static str, MappingEntry>,
    starters: BTreeSet<&'static str>,
}

impl CorrelationMap {
    /// Runs `S::configure_mapping` and validates the result.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::DuplicateMapping`] if a message type is mapped twice
    /// - [`ConfigError::StateNotADocument`] if `S::State` does not serialize to an object
    /// - [`ConfigError::UnknownStateField`] if a mapping targets a field the
    ///   default state document lacks
    pub fn build<S: Saga>() -> Result<Self, ConfigError> {
        let mut mapper = StateMapper::<S>::new();
        S::configure_mapping(&mut mapper);

        let template = serde_json::to_value(S::State::default()).map_err(|e| {
            ConfigError::StateNotADocument {
                saga_type: S::SAGA_TYPE,
                reason: e.to_string(),
            }
        })?;
        let Some(fields) = template.as_object() else {
            return Err(ConfigError::StateNotADocument {
                saga_type: S::SAGA_TYPE,
                reason: "state does not serialize to an object".to_string(),
            });
        };

        let mut entries = BTreeMap::new();
        for (message_type, entry) in mapper.entries {
            if !fields.contains_key(&entry.state_field) {
                return Err(ConfigError::UnknownStateField {
                    saga_type: S::SAGA_TYPE,
                    field: entry.state_field,
                });
            }
            if entries.insert(message_type, entry).is_some() {
                return Err(ConfigError::DuplicateMapping {
                    saga_type: S::SAGA_TYPE,
                    message_type,
                });
            }
        }

        Ok(Self {
            saga_type: S::SAGA_TYPE,
            entries,
            starters: mapper.starters,
        })
    }

    #[must_use]
    pub fn saga_type(&self) -> &'static str {
        self.saga_type
    }

    /// Mapping entry for a message type, if one was declared.
    #[must_use]
    pub fn entry(&self, message_type: &str) -> Option<&MappingEntry> {
        self.entries.get(message_type)
    }

    /// Whether `message_type` may create a new saga instance.
    #[must_use]
    pub fn is_start_trigger(&self, message_type: &str) -> bool {
        self.starters.contains(message_type)
    }

    /// Mapped message types in deterministic order.
    pub fn message_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolves the correlation key of `message`.
    ///
    /// Returns `Ok(None)` when the message type has no mapping entry.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] if the mapped field is missing from the
    /// message or holds a non-scalar value.
    pub fn correlate(&self, message: &dyn AnyMessage) -> Result<Option<CorrelationKey>, CodecError> {
        let Some(entry) = self.entries.get(message.message_type()) else {
            return Ok(None);
        };
        let value = correlation_value(message, &entry.message_field)?;
        Ok(Some(CorrelationKey {
            saga_type: self.saga_type,
            field: entry.state_field.clone(),
            value,
        }))
    }
}

/// Identifies one saga instance: the saga type plus `state.field == value`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    pub saga_type: &'static str,
    pub field: String,
    pub value: CorrelationValue,
}

impl CorrelationKey {
    /// Whether a stored state document belongs to this key.
    #[must_use]
    pub fn matches_document(&self, document: &serde_json::Value) -> bool {
        document
            .get(&self.field)
            .is_some_and(|v| self.value.matches(v))
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}={}", self.saga_type, self.field, self.value)
    }
}

/// Reads `field` out of the message's document.
///
/// # Errors
///
/// Returns [`CodecError::MissingField`] or [`CodecError::InvalidCorrelation`].
pub fn correlation_value(
    message: &dyn AnyMessage,
    field: &str,
) -> Result<CorrelationValue, CodecError> {
    let document = message.to_document()?;
    let value = document.get(field).ok_or_else(|| CodecError::MissingField {
        message_type: message.message_type(),
        field: field.to_string(),
    })?;
    CorrelationValue::from_json(field, value)
}

/// Encodes typed state into its stored document form.
///
/// # Errors
///
/// Returns [`CodecError::Json`] if serialization fails.
pub fn encode_state<T: SagaState>(state: &T) -> Result<serde_json::Value, CodecError> {
    Ok(serde_json::to_value(state)?)
}

/// Decodes a stored document into typed state.
///
/// # Errors
///
/// Returns [`CodecError::Json`] if the document does not fit `T`.
pub fn decode_state<T: SagaState>(document: &serde_json::Value) -> Result<T, CodecError> {
    Ok(T::deserialize(document)?)
}

/// Builds the document of a brand-new saga instance: the default state with
/// the correlation field set to the key's value.
///
/// The result is decoded once to make sure the correlation value fits the
/// field's type.
///
/// # Errors
///
/// Returns [`CodecError::NotAnObject`] or [`CodecError::Json`].
pub fn synthesize_state<T: SagaState>(key: &CorrelationKey) -> Result<serde_json::Value, CodecError> {
    let mut document = encode_state(&T::default())?;
    let fields = document.as_object_mut().ok_or(CodecError::NotAnObject {
        type_name: key.saga_type,
    })?;
    fields.insert(key.field.clone(), key.value.to_json());
    decode_state::<T>(&document)?;
    Ok(document)
}
