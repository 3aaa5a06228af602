//! Dispatch: from a decoded message to handler invocations.
//!
//! - [`correlation`]: eager, shared table of saga correlation maps
//! - [`registry`]: static registration of handlers, sagas, and preview hooks
//! - [`invoker`]: type-erased bridges from a message to a concrete handler
//! - [`context`]: the per-invocation hydrate/lock/invoke/save/release sequence
//! - [`router`]: fans a message out to every matching handler
//! - [`middleware`]: tower layers wrapped around the router

pub mod context;
pub mod correlation;
pub mod invoker;
pub mod middleware;
pub mod registry;
pub mod router;

pub use context::{DispatchEnv, Invocation, StatefulContext};
pub use correlation::CorrelationRegistry;
pub use invoker::{Invoker, SagaInvoker, StatelessInvoker};
pub use middleware::{build_delivery_pipeline, DeliveryPipeline};
pub use registry::{HandlerProvider, HandlerRegistration, HandlerRegistry, SagaRegistration};
pub use router::{Delivery, MessageRouter, RouteReport};
