//! `simplebus` runtime: message routing, saga hydration, lease locks, state
//! stores, and an in-process transport.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod host;
pub mod lock;
pub mod samples;
pub mod storage;
pub mod transport;

pub use config::{BusConfig, LockConfig, TransportConfig};
pub use dispatch::{HandlerRegistry, MessageRouter, RouteReport, StatefulContext};
pub use error::BusError;
pub use host::{BusBuilder, BusHost};
pub use lock::{DistributedLock, Lease, ReleaseOutcome};
pub use storage::{MemoryStateStore, StateStore};
pub use transport::{BusHandle, HealthState, ServiceBus};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
