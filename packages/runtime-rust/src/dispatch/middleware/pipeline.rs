//! Pipeline composition: combines the middleware layers into a single service stack.

use tower::ServiceBuilder;

use super::load_shed::{LoadShedLayer, LoadShedService};
use super::metrics::{MetricsLayer, MetricsService};
use crate::config::TransportConfig;
use crate::dispatch::router::MessageRouter;

/// The delivery service the transport drives.
pub type DeliveryPipeline = LoadShedService<MetricsService<MessageRouter>>;

/// Build the delivery pipeline by wrapping the `MessageRouter` with middleware layers.
///
/// Layer order (outermost to innermost):
/// 1. `LoadShedLayer` -- reject beyond the prefetch bound before doing any work
/// 2. `MetricsLayer` -- record timing and outcome (closest to the router)
#[must_use]
pub fn build_delivery_pipeline(router: MessageRouter, config: &TransportConfig) -> DeliveryPipeline {
    ServiceBuilder::new()
        .layer(LoadShedLayer::new(config.prefetch))
        .layer(MetricsLayer)
        .service(router)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
