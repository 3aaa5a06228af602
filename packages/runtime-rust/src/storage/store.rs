//! The state store contract consumed by the lock and the invocation context.

use async_trait::async_trait;
use simplebus_core::CorrelationKey;

use super::record::{
    CreateOutcome, LeaseFence, LeaseRecord, OwnerToken, ResourceId, SaveOutcome, StateRecord,
    StateUpdate,
};

/// Keyed persistence of saga state plus the lease primitive over the same
/// records.
///
/// State records are addressed by [`CorrelationKey`]: the saga type plus an
/// exact match of one named field inside the stored document. Leases are
/// addressed by the record's [`ResourceId`].
///
/// Used as `Arc<dyn StateStore>`. Implementations must make `create`,
/// `insert_lease`, and the two conditional lease deletes atomic with respect
/// to each other.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Prepares the backing storage (tables, files). Idempotent.
    async fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Flushes and releases the backing storage.
    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Loads the record matching `key`.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::NotUnique`](super::StoreError::NotUnique) if
    /// more than one record matches.
    async fn get(&self, key: &CorrelationKey) -> anyhow::Result<Option<StateRecord>>;

    /// Inserts `record` unless a record matching `key` already exists.
    async fn create(&self, key: &CorrelationKey, record: StateRecord)
        -> anyhow::Result<CreateOutcome>;

    /// Replaces the document of an existing record and records completion,
    /// provided `fence` admits the current lease on it.
    async fn save(
        &self,
        resource_id: &ResourceId,
        update: StateUpdate,
        fence: &LeaseFence,
        now: u64,
    ) -> anyhow::Result<SaveOutcome>;

    /// Deletes the record. Returns whether a record was removed.
    async fn delete(&self, resource_id: &ResourceId) -> anyhow::Result<bool>;

    /// Current lease on `resource_id`, expired or not.
    async fn find_lease(&self, resource_id: &ResourceId) -> anyhow::Result<Option<LeaseRecord>>;

    /// Inserts `lease` if no lease exists for its resource.
    /// Returns whether the insert happened.
    async fn insert_lease(&self, lease: LeaseRecord) -> anyhow::Result<bool>;

    /// Deletes the lease on `resource_id` only if its expiry still equals
    /// `expires_at`.
    async fn delete_lease_if_expires(
        &self,
        resource_id: &ResourceId,
        expires_at: u64,
    ) -> anyhow::Result<bool>;

    /// Deletes the lease on `resource_id` only if `owner` holds it.
    async fn delete_lease_if_owner(
        &self,
        resource_id: &ResourceId,
        owner: &OwnerToken,
    ) -> anyhow::Result<bool>;
}
