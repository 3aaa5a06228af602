//! In-memory [`StateStore`] implementation backed by [`DashMap`].
//!
//! Lease operations are single-entry atomic updates. Record creation takes a
//! short mutex so that two concurrent first messages for the same
//! correlation value cannot both insert. Suitable for tests and for
//! single-process deployments that do not need state to survive restarts.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use simplebus_core::CorrelationKey;

use crate::storage::record::{
    CreateOutcome, LeaseFence, LeaseRecord, OwnerToken, ResourceId, SaveOutcome, StateRecord,
    StateUpdate, StoreError,
};
use crate::storage::store::StateStore;

/// In-memory state store.
pub struct MemoryStateStore {
    records: DashMap<ResourceId, StateRecord>,
    leases: DashMap<ResourceId, LeaseRecord>,
    create_guard: Mutex<()>,
}

impl MemoryStateStore {
    /// Creates a new, empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            leases: DashMap::new(),
            create_guard: Mutex::new(()),
        }
    }

    /// Number of stored state records.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Number of stored leases, expired or not.
    #[must_use]
    pub fn lease_count(&self) -> usize {
        self.leases.len()
    }

    fn find(&self, key: &CorrelationKey) -> Result<Option<StateRecord>, StoreError> {
        let mut matches: Vec<StateRecord> = self
            .records
            .iter()
            .filter(|entry| {
                entry.value().saga_type == key.saga_type
                    && key.matches_document(&entry.value().document)
            })
            .map(|entry| entry.value().clone())
            .collect();

        if matches.len() > 1 {
            return Err(StoreError::NotUnique {
                key: key.to_string(),
                matches: matches.len(),
            });
        }
        Ok(matches.pop())
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &CorrelationKey) -> anyhow::Result<Option<StateRecord>> {
        Ok(self.find(key)?)
    }

    async fn create(
        &self,
        key: &CorrelationKey,
        record: StateRecord,
    ) -> anyhow::Result<CreateOutcome> {
        let _guard = self.create_guard.lock();
        if let Some(existing) = self.find(key)? {
            return Ok(CreateOutcome::AlreadyExists(existing));
        }
        self.records.insert(record.resource_id, record.clone());
        Ok(CreateOutcome::Created(record))
    }

    async fn save(
        &self,
        resource_id: &ResourceId,
        update: StateUpdate,
        fence: &LeaseFence,
        now: u64,
    ) -> anyhow::Result<SaveOutcome> {
        // The lease shard stays read-locked until the write is done, so a
        // reclaiming contender cannot delete it in between.
        let Some(lease) = self.leases.get(resource_id) else {
            return Ok(SaveOutcome::Fenced);
        };
        if !fence.admits(lease.value()) {
            return Ok(SaveOutcome::Fenced);
        }
        let Some(mut record) = self.records.get_mut(resource_id) else {
            return Ok(SaveOutcome::Missing);
        };
        record.apply(update, now);
        Ok(SaveOutcome::Saved)
    }

    async fn delete(&self, resource_id: &ResourceId) -> anyhow::Result<bool> {
        Ok(self.records.remove(resource_id).is_some())
    }

    async fn find_lease(&self, resource_id: &ResourceId) -> anyhow::Result<Option<LeaseRecord>> {
        Ok(self.leases.get(resource_id).map(|l| l.value().clone()))
    }

    async fn insert_lease(&self, lease: LeaseRecord) -> anyhow::Result<bool> {
        match self.leases.entry(lease.resource_id) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(lease);
                Ok(true)
            }
        }
    }

    async fn delete_lease_if_expires(
        &self,
        resource_id: &ResourceId,
        expires_at: u64,
    ) -> anyhow::Result<bool> {
        Ok(self
            .leases
            .remove_if(resource_id, |_, lease| lease.expires_at == expires_at)
            .is_some())
    }

    async fn delete_lease_if_owner(
        &self,
        resource_id: &ResourceId,
        owner: &OwnerToken,
    ) -> anyhow::Result<bool> {
        Ok(self
            .leases
            .remove_if(resource_id, |_, lease| lease.owner == *owner)
            .is_some())
    }
}
