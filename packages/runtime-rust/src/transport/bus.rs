//! The sending side of the bus.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use simplebus_core::{Envelope, Message};

use crate::error::BusError;

/// Fire-and-forget sender implemented by a transport.
///
/// Neither call confirms delivery; success only means the transport
/// accepted the envelope.
#[async_trait]
pub trait ServiceBus: Send + Sync {
    /// Publishes `envelope` for immediate delivery.
    async fn send(&self, envelope: Envelope) -> Result<(), BusError>;

    /// Publishes `envelope` for delivery once `delay` has elapsed.
    async fn retry(&self, envelope: Envelope, delay: Duration) -> Result<(), BusError>;
}

/// Typed, cloneable handle over a [`ServiceBus`].
#[derive(Clone)]
pub struct BusHandle {
    inner: Arc<dyn ServiceBus>,
}

impl BusHandle {
    #[must_use]
    pub fn new(inner: Arc<dyn ServiceBus>) -> Self {
        Self { inner }
    }

    /// Sends `message`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Codec`] if the message cannot be encoded, or
    /// [`BusError::TransportClosed`] if the transport has stopped.
    pub async fn send<M: Message>(&self, message: &M) -> Result<(), BusError> {
        self.inner.send(Envelope::enclose(message)?).await
    }

    /// Sends `message` after `delay`.
    ///
    /// # Errors
    ///
    /// Same as [`BusHandle::send`].
    pub async fn retry<M: Message>(&self, message: &M, delay: Duration) -> Result<(), BusError> {
        self.inner.retry(Envelope::enclose(message)?, delay).await
    }

    /// The underlying untyped sender.
    #[must_use]
    pub fn sender(&self) -> &Arc<dyn ServiceBus> {
        &self.inner
    }
}

impl std::fmt::Debug for BusHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusHandle").finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::testing::RecordingBus;
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
    }

    impl Message for Ping {
        const MESSAGE_TYPE: &'static str = "test.ping";
    }

    #[tokio::test]
    async fn handle_encloses_typed_messages() {
        let recorder = Arc::new(RecordingBus::default());
        let handle = BusHandle::new(recorder.clone());

        handle.send(&Ping { seq: 1 }).await.unwrap();
        handle.retry(&Ping { seq: 2 }, Duration::from_secs(2)).await.unwrap();

        assert_eq!(recorder.sent_types(), vec!["test.ping"]);
        assert_eq!(recorder.sent.lock()[0].open_as::<Ping>().unwrap(), Ping { seq: 1 });
        let retried = recorder.retried.lock();
        assert_eq!(retried[0].1, Duration::from_secs(2));
        assert_eq!(retried[0].0.open_as::<Ping>().unwrap(), Ping { seq: 2 });
    }
}
