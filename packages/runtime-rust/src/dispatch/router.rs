//! Message routing: fans a message out to every handler registered for its
//! exact type and awaits all of them.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::future::join_all;
use simplebus_core::AnyMessage;
use tower::Service;
use tracing::{debug, error};

use super::context::StatefulContext;
use super::registry::HandlerProvider;
use crate::error::BusError;

// ---------------------------------------------------------------------------
// Delivery / RouteReport
// ---------------------------------------------------------------------------

/// A decoded message handed over by the transport.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Arc<dyn AnyMessage>,
    /// Transport-assigned id, for log correlation.
    pub delivery_id: u64,
    /// 1 for the first delivery, incremented on each redelivery.
    pub attempt: u32,
}

/// Summary of one routed message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteReport {
    /// Handlers the message was dispatched to.
    pub matched: usize,
    /// Handlers whose failure was caught and swallowed.
    pub handler_failures: usize,
    /// Saga instances completed (and deleted) by this message.
    pub completed: usize,
}

// ---------------------------------------------------------------------------
// MessageRouter
// ---------------------------------------------------------------------------

/// Routes messages to handlers via a [`HandlerProvider`].
///
/// Capability match is nominal and exact on the message's wire name.
/// Siblings run concurrently and independently: one handler failing or
/// waiting on a lock does not affect the others. A message nobody handles is
/// a silent no-op.
#[derive(Clone)]
pub struct MessageRouter {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    provider: Arc<dyn HandlerProvider>,
    context: StatefulContext,
}

impl MessageRouter {
    #[must_use]
    pub fn new(provider: Arc<dyn HandlerProvider>, context: StatefulContext) -> Self {
        Self {
            inner: Arc::new(RouterInner { provider, context }),
        }
    }

    /// Routes `message` and waits for every matched handler.
    ///
    /// # Errors
    ///
    /// Returns the first store, codec, or configuration error raised by any
    /// sibling, after all siblings have finished. Handler failures are not
    /// errors; they are counted in the report.
    pub async fn route(&self, message: Arc<dyn AnyMessage>) -> Result<RouteReport, BusError> {
        let message_type = message.message_type();

        for hook in self.inner.provider.previews() {
            hook.peek(message.as_ref());
        }

        let invokers = self.inner.provider.resolve(message_type);
        if invokers.is_empty() {
            debug!(message_type, "no handler registered, message ignored");
            return Ok(RouteReport::default());
        }

        let context = &self.inner.context;
        let results = join_all(
            invokers
                .iter()
                .map(|invoker| invoker.invoke(message.as_ref(), context)),
        )
        .await;

        let mut report = RouteReport {
            matched: invokers.len(),
            ..RouteReport::default()
        };
        let mut first_error = None;
        for (invoker, result) in invokers.iter().zip(results) {
            match result {
                Ok(invocation) => {
                    report.handler_failures += usize::from(invocation.failed);
                    report.completed += usize::from(invocation.completed);
                }
                Err(e) => {
                    error!(
                        handler = invoker.handler_name(),
                        message_type,
                        error = %e,
                        "invocation failed"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

impl Service<Delivery> for MessageRouter {
    type Response = RouteReport;
    type Error = BusError;
    type Future = Pin<Box<dyn Future<Output = Result<RouteReport, BusError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, delivery: Delivery) -> Self::Future {
        let router = self.clone();
        Box::pin(async move { router.route(delivery.message).await })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use simplebus_core::{Handle, Handler, Message, MessagePreview, Outbox};
    use tower::ServiceExt;

    use super::*;
    use crate::dispatch::context::tests::{fixture, Begin, Fixture, Step, StepSaga};
    use crate::dispatch::registry::HandlerRegistry;

    #[derive(Clone)]
    struct Tally(Arc<AtomicU32>);

    impl Handler for Tally {}

    #[async_trait]
    impl Handle<Step> for Tally {
        async fn handle(&mut self, _m: &Step, _bus: &mut Outbox) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Peek(Arc<AtomicU32>);

    impl MessagePreview for Peek {
        fn peek(&self, message: &dyn AnyMessage) {
            assert!(message.message_type().starts_with("ctx."));
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn router(f: &Fixture, tally: &Arc<AtomicU32>, peeks: &Arc<AtomicU32>) -> MessageRouter {
        let registry = HandlerRegistry::new();
        registry
            .saga(|| StepSaga::new(Arc::default()))
            .unwrap()
            .handles::<Begin>()
            .unwrap()
            .handles::<Step>()
            .unwrap();
        let tally = Tally(Arc::clone(tally));
        registry
            .handler(move || tally.clone())
            .handles::<Step>()
            .unwrap();
        registry.preview(Peek(Arc::clone(peeks)));
        MessageRouter::new(Arc::new(registry), f.context.clone())
    }

    fn step(id: &str, fail: bool) -> Arc<dyn AnyMessage> {
        Arc::new(Step {
            id: id.to_string(),
            fail,
            finish: false,
        })
    }

    #[tokio::test]
    async fn unmatched_message_is_a_no_op() {
        let f = fixture();
        let (tally, peeks) = (Arc::default(), Arc::default());
        let router = router(&f, &tally, &peeks);

        #[derive(serde::Serialize, serde::Deserialize)]
        struct Orphan;
        impl Message for Orphan {
            const MESSAGE_TYPE: &'static str = "ctx.orphan";
        }

        let report = router.route(Arc::new(Orphan)).await.unwrap();
        assert_eq!(report, RouteReport::default());
        assert_eq!(peeks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_saga_does_not_affect_sibling() {
        let f = fixture();
        let (tally, peeks) = (Arc::default(), Arc::default());
        let router = router(&f, &tally, &peeks);

        router
            .route(Arc::new(Begin { id: "s".to_string() }))
            .await
            .unwrap();
        let report = router.route(step("s", true)).await.unwrap();

        assert_eq!(
            report,
            RouteReport {
                matched: 2,
                handler_failures: 1,
                completed: 0,
            }
        );
        assert_eq!(tally.load(Ordering::SeqCst), 1);
        assert_eq!(f.store.lease_count(), 0);
    }

    #[tokio::test]
    async fn store_level_error_surfaces_after_siblings_finish() {
        let f = fixture();
        let (tally, peeks) = (Arc::default(), Arc::default());
        let router = router(&f, &tally, &peeks);

        // No state for "missing": the saga cannot materialize, the sibling
        // still runs.
        let err = router.route(step("missing", false)).await.unwrap_err();
        assert!(matches!(err, BusError::CannotMaterialize { .. }));
        assert_eq!(tally.load(Ordering::SeqCst), 1);
        assert_eq!(f.store.record_count(), 0);
    }

    #[tokio::test]
    async fn router_is_a_tower_service() {
        let f = fixture();
        let (tally, peeks) = (Arc::default(), Arc::default());
        let router = router(&f, &tally, &peeks);

        let report = router
            .oneshot(Delivery {
                message: Arc::new(Begin { id: "t".to_string() }),
                delivery_id: 7,
                attempt: 1,
            })
            .await
            .unwrap();
        assert_eq!(report.matched, 1);
        assert_eq!(f.store.record_count(), 1);
    }
}
