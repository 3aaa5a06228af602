//! Error types shared by the message model and the correlation mapping model.

/// Failures encoding, decoding, or inspecting message and state documents.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The envelope names a message type that no catalog entry can open.
    #[error("unknown message type `{message_type}`, unable to open envelope")]
    UnknownMessageType { message_type: String },

    /// The envelope's type tag does not match the requested message type.
    #[error("envelope carries `{actual}`, expected `{expected}`")]
    TypeMismatch {
        expected: &'static str,
        actual: String,
    },

    /// A correlation field is missing from the message document.
    #[error("message `{message_type}` has no field `{field}`")]
    MissingField {
        message_type: &'static str,
        field: String,
    },

    /// A correlation field holds a value that cannot identify a saga.
    #[error("field `{field}` cannot be used for correlation: {reason}")]
    InvalidCorrelation { field: String, reason: String },

    /// State or message document is not a JSON object.
    #[error("document for `{type_name}` is not an object")]
    NotAnObject { type_name: &'static str },

    #[error("msgpack encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("msgpack decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("json document error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Invalid handler or saga registration, detected at startup.
///
/// These are fatal: a bus with a configuration error must not start.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Two mapping entries were declared for the same message type.
    #[error("saga `{saga_type}` maps message `{message_type}` more than once")]
    DuplicateMapping {
        saga_type: &'static str,
        message_type: &'static str,
    },

    /// A mapping names a state field the saga's state does not have.
    #[error("saga `{saga_type}` maps to unknown state field `{field}`")]
    UnknownStateField {
        saga_type: &'static str,
        field: String,
    },

    /// The saga's default state does not serialize to a JSON object.
    #[error("state of saga `{saga_type}` is not a document: {reason}")]
    StateNotADocument {
        saga_type: &'static str,
        reason: String,
    },

    /// A saga handles a message type it has no correlation mapping for.
    #[error("saga `{saga_type}` has no mapping data for message `{message_type}`")]
    MissingMapping {
        saga_type: &'static str,
        message_type: &'static str,
    },

    /// Two distinct saga types declared the same `SAGA_TYPE` name.
    #[error("saga type `{saga_type}` is claimed by both `{registered}` and `{conflicting}`")]
    SagaTypeConflict {
        saga_type: &'static str,
        registered: &'static str,
        conflicting: &'static str,
    },

    /// The same handler type was registered twice for one message type.
    #[error("handler `{handler}` is registered more than once for message `{message_type}`")]
    AmbiguousHandler {
        handler: &'static str,
        message_type: &'static str,
    },
}

/// A saga accessed its state before the invocation context assigned it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("state slot of saga `{saga_type}` has not been hydrated")]
pub struct StateSlotEmpty {
    pub saga_type: &'static str,
}
