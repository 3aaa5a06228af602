//! Message identity and the type-erased message view used by the router.

use std::any::Any;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// An immutable, typed payload routed by the bus.
///
/// `MESSAGE_TYPE` is the nominal identity of the type: routing matches it
/// exactly (no subtyping), and envelopes carry it on the wire. It must be
/// unique across every message type a process registers.
///
/// ```rust,ignore
/// #[derive(Serialize, Deserialize)]
/// pub struct Table1Staged {
///     pub import_id: Uuid,
///     pub success: bool,
/// }
///
/// impl Message for Table1Staged {
///     const MESSAGE_TYPE: &'static str = "import.table1-staged";
/// }
/// ```
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable wire name of this message type.
    const MESSAGE_TYPE: &'static str;
}

/// Object-safe view of a [`Message`], as delivered by a transport.
///
/// Blanket-implemented for every `Message`; handler code never implements it.
pub trait AnyMessage: Send + Sync + 'static {
    /// Wire name of the concrete message type.
    fn message_type(&self) -> &'static str;

    /// Upcast for downcasting back to the concrete type.
    fn as_any(&self) -> &dyn Any;

    /// Serializes the message to a JSON document.
    ///
    /// Correlation values are read out of this document by field name.
    ///
    /// # Errors
    ///
    /// Returns an error if the message's `Serialize` impl fails.
    fn to_document(&self) -> serde_json::Result<serde_json::Value>;
}

impl<M: Message> AnyMessage for M {
    fn message_type(&self) -> &'static str {
        M::MESSAGE_TYPE
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn to_document(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

impl fmt::Debug for dyn AnyMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyMessage")
            .field("message_type", &self.message_type())
            .finish_non_exhaustive()
    }
}

/// Recovers the concrete message from an erased one.
#[must_use]
pub fn downcast_message<M: Message>(message: &dyn AnyMessage) -> Option<&M> {
    message.as_any().downcast_ref::<M>()
}


#[cfg(test)]
mod tests {
    use super::fixtures::{OrderPlaced, OrderShipped};
    use super::*;

    #[test]
    fn erased_view_reports_wire_name() {
        let msg = OrderPlaced {
            order_id: "o-1".to_string(),
            amount: 10,
        };
        let erased: &dyn AnyMessage = &msg;
        assert_eq!(erased.message_type(), "test.order-placed");
    }

    #[test]
    fn downcast_matches_exact_type_only() {
        let msg = OrderPlaced {
            order_id: "o-1".to_string(),
            amount: 10,
        };
        let erased: &dyn AnyMessage = &msg;
        assert_eq!(downcast_message::<OrderPlaced>(erased), Some(&msg));
        assert!(downcast_message::<OrderShipped>(erased).is_none());
    }

    #[test]
    fn document_exposes_fields_by_name() {
        let msg = OrderShipped {
            order_ref: "o-9".to_string(),
        };
        let doc = msg.to_document().unwrap();
        assert_eq!(doc["order_ref"], "o-9");
    }
}
