//! Saga state persistence.
//!
//! - [`StateStore`]: the narrow contract the lock and the invocation context
//!   consume (keyed get/create/save/delete plus lease primitives)
//! - [`record`]: persisted record shapes and conditional-write outcomes
//! - [`engines`]: the in-memory engine and the durable `redb` engine

pub mod engines;
pub mod record;
pub mod store;

pub use engines::MemoryStateStore;
#[cfg(feature = "redb")]
pub use engines::RedbStateStore;
pub use record::*;
pub use store::*;
