//! Serialization envelope and the message catalog that opens it.
//!
//! An [`Envelope`] pairs a message's wire name with its `MsgPack` payload.
//! Payloads are written with `rmp_serde::to_vec_named()` so field names
//! survive on the wire and producers in other languages can read them.
//! The [`MessageCatalog`] is the static table that maps wire names back to
//! concrete types on the receiving side.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::message::{AnyMessage, Message};

/// Type-tagged, serialized message as it travels through a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Wire name of the enclosed message (`Message::MESSAGE_TYPE`).
    pub message_type: String,
    /// `MsgPack`-encoded message body.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Encloses a typed message.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if the message cannot be serialized.
    pub fn enclose<M: Message>(message: &M) -> Result<Self, CodecError> {
        Ok(Self {
            message_type: M::MESSAGE_TYPE.to_string(),
            payload: rmp_serde::to_vec_named(message)?,
        })
    }

    /// Opens the envelope as a known message type.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::TypeMismatch`] if the envelope holds a different
    /// type, or [`CodecError::Decode`] if the payload is malformed.
    pub fn open_as<M: Message>(&self) -> Result<M, CodecError> {
        if self.message_type != M::MESSAGE_TYPE {
            return Err(CodecError::TypeMismatch {
                expected: M::MESSAGE_TYPE,
                actual: self.message_type.clone(),
            });
        }
        Ok(rmp_serde::from_slice(&self.payload)?)
    }

    /// Frames the whole envelope as bytes for a byte-oriented transport.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] on serialization failure.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Reads an envelope framed by [`Envelope::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] if the bytes are not a valid envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

type Decoder = Arc<dyn Fn(&[u8]) -> Result<Box<dyn AnyMessage>, CodecError> + Send + Sync>;

/// Static table of message decoders, keyed by wire name.
///
/// Built once at startup; every message type a process may receive must be
/// registered before the transport starts.
#[derive(Clone, Default)]
pub struct MessageCatalog {
    decoders: HashMap<&'static str, Decoder>,
}

impl MessageCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a message type. Registering the same type twice is a no-op.
    pub fn register<M: Message>(&mut self) -> &mut Self {
        self.decoders.entry(M::MESSAGE_TYPE).or_insert_with(|| {
            Arc::new(|bytes: &[u8]| {
                let message: M = rmp_serde::from_slice(bytes)?;
                Ok(Box::new(message) as Box<dyn AnyMessage>)
            })
        });
        self
    }

    /// Whether the catalog can open envelopes of this wire name.
    #[must_use]
    pub fn contains(&self, message_type: &str) -> bool {
        self.decoders.contains_key(message_type)
    }

    /// Number of registered message types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    /// Whether no message types are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Decodes an envelope into its concrete message type.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnknownMessageType`] if the wire name is not
    /// registered, or [`CodecError::Decode`] for a malformed payload.
    pub fn open(&self, envelope: &Envelope) -> Result<Box<dyn AnyMessage>, CodecError> {
        let decoder = self
            .decoders
            .get(envelope.message_type.as_str())
            .ok_or_else(|| CodecError::UnknownMessageType {
                message_type: envelope.message_type.clone(),
            })?;
        decoder(&envelope.payload)
    }
}

impl std::fmt::Debug for MessageCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.decoders.keys().collect();
        names.sort();
        f.debug_struct("MessageCatalog")
            .field("message_types", &names)
            .finish()
    }
}
