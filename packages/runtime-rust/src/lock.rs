//! Lease-based distributed lock over a single stored resource.
//!
//! Acquisition is a spin-poll: insert a lease if none exists, reclaim an
//! expired lease with a compare-and-delete on its expiry, otherwise sleep one
//! poll interval and try again. There is no queue, so arrival order under
//! contention is not preserved; waiting is bounded by the lease TTL.

use std::sync::Arc;
use std::time::Duration;

use simplebus_core::{ClockSource, CorrelationKey};
use tracing::{debug, warn};

use crate::config::LockConfig;
use crate::storage::{LeaseFence, LeaseRecord, OwnerToken, ResourceId, StateStore};

/// An acquired lease. Hand it back to [`DistributedLock::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub resource_id: ResourceId,
    pub owner: OwnerToken,
    /// Absolute expiry, millis since epoch.
    pub expires_at: u64,
}

impl Lease {
    /// Fence for a state save performed at `now` under this lease.
    #[must_use]
    pub fn fence(&self, now: u64) -> LeaseFence {
        LeaseFence {
            resource_id: self.resource_id,
            owner: self.owner,
            now,
        }
    }
}

/// Result of releasing a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// The lease had already expired and been reclaimed (or removed); the
    /// holder's exclusivity window was void from the moment it expired.
    Stale,
}

/// Distributed lock bound to a state store and a clock.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn ClockSource>,
    config: LockConfig,
}

impl DistributedLock {
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn ClockSource>, config: LockConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Clock used for lease expiry.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn ClockSource> {
        &self.clock
    }

    #[must_use]
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Makes one acquisition attempt.
    ///
    /// Returns `None` if a live lease is held by someone else, or if another
    /// contender won the insert after a stale lease was reclaimed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn try_acquire(&self, resource_id: &ResourceId) -> anyhow::Result<Option<Lease>> {
        let now = self.clock.now();

        if let Some(existing) = self.store.find_lease(resource_id).await? {
            if !existing.is_expired(now) {
                debug!(
                    resource = %resource_id,
                    remaining_ms = existing.expires_at - now,
                    "lease held"
                );
                return Ok(None);
            }
            let reclaimed = self
                .store
                .delete_lease_if_expires(resource_id, existing.expires_at)
                .await?;
            debug!(
                resource = %resource_id,
                expired_ms = now - existing.expires_at,
                reclaimed,
                "expired lease found"
            );
        }

        let lease = LeaseRecord {
            resource_id: *resource_id,
            owner: OwnerToken::new(),
            expires_at: now.saturating_add(millis(self.config.lease_ttl)),
        };
        if !self.store.insert_lease(lease.clone()).await? {
            debug!(resource = %resource_id, "lost lease insert race");
            return Ok(None);
        }

        debug!(resource = %resource_id, owner = %lease.owner, "lease acquired");
        Ok(Some(Lease {
            resource_id: lease.resource_id,
            owner: lease.owner,
            expires_at: lease.expires_at,
        }))
    }

    /// Blocks until the lease on `resource_id` is acquired.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails; contention alone never errors.
    pub async fn acquire(&self, resource_id: &ResourceId) -> anyhow::Result<Lease> {
        loop {
            if let Some(lease) = self.try_acquire(resource_id).await? {
                return Ok(lease);
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Locks the saga instance identified by `key`.
    ///
    /// Returns `None` if no state record exists for the key.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn lock(&self, key: &CorrelationKey) -> anyhow::Result<Option<Lease>> {
        match self.store.get(key).await? {
            Some(record) => Ok(Some(self.acquire(&record.resource_id).await?)),
            None => Ok(None),
        }
    }

    /// Releases `lease` if its owner still holds it.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn release(&self, lease: Lease) -> anyhow::Result<ReleaseOutcome> {
        if self
            .store
            .delete_lease_if_owner(&lease.resource_id, &lease.owner)
            .await?
        {
            debug!(resource = %lease.resource_id, owner = %lease.owner, "lease released");
            return Ok(ReleaseOutcome::Released);
        }

        warn!(
            resource = %lease.resource_id,
            owner = %lease.owner,
            expires_at = lease.expires_at,
            "lease expired before it could be released"
        );
        metrics::counter!("simplebus_stale_lock_releases_total").increment(1);
        Ok(ReleaseOutcome::Stale)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
