//! Tower middleware layers for the delivery pipeline.
//!
//! - [`metrics`]: Delivery timing and counting via `tracing` spans and `metrics`
//! - [`load_shed`]: Semaphore-based bound on concurrent deliveries
//! - [`pipeline`]: Composes all layers into a single service stack

pub mod load_shed;
pub mod metrics;
pub mod pipeline;

pub use load_shed::LoadShedLayer;
pub use metrics::MetricsLayer;
pub use pipeline::{build_delivery_pipeline, DeliveryPipeline};
