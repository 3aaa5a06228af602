//! Concrete [`StateStore`](super::StateStore) engines.

pub mod memory;
#[cfg(feature = "redb")]
pub mod redb;

pub use memory::MemoryStateStore;
#[cfg(feature = "redb")]
pub use self::redb::RedbStateStore;
