//! Metrics middleware for deliveries.
//!
//! Wraps each delivery in a `tracing` span and records a counter and a
//! duration histogram through the `metrics` facade.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::dispatch::router::{Delivery, RouteReport};
use crate::error::BusError;

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

/// Tower layer that instruments deliveries with timing and outcome.
#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Service wrapper that records delivery duration and outcome.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<Delivery> for MetricsService<S>
where
    S: Service<Delivery, Response = RouteReport, Error = BusError> + Send,
    S::Future: Send + 'static,
{
    type Response = RouteReport;
    type Error = BusError;
    type Future = Pin<Box<dyn Future<Output = Result<RouteReport, BusError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, delivery: Delivery) -> Self::Future {
        let message_type = delivery.message.message_type();
        let delivery_id = delivery.delivery_id;

        let span = info_span!(
            "delivery",
            message_type,
            delivery_id,
            attempt = delivery.attempt,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(delivery);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();

                let outcome = match &result {
                    Ok(report) if report.matched == 0 => "unmatched",
                    Ok(_) => "ok",
                    Err(e) if e.is_configuration() => "config_error",
                    Err(_) => "error",
                };

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = elapsed.as_millis() as u64;
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);

                metrics::counter!(
                    "simplebus_deliveries_total",
                    "message_type" => message_type,
                    "outcome" => outcome
                )
                .increment(1);
                metrics::histogram!(
                    "simplebus_delivery_duration_seconds",
                    "message_type" => message_type
                )
                .record(elapsed.as_secs_f64());

                tracing::debug!(
                    message_type,
                    delivery_id,
                    duration_ms,
                    outcome,
                    "delivery complete"
                );

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
