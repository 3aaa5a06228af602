//! Record types for the state store.
//!
//! Defines the persisted shapes ([`StateRecord`], [`LeaseRecord`]), their
//! identities ([`ResourceId`], [`OwnerToken`]), and the outcomes of the
//! store's conditional writes.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of one stored saga instance.
///
/// Assigned when the state record is created and stable until it is deleted.
/// Leases are keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(Uuid);

impl ResourceId {
    /// Generates a fresh random identity.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ResourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Owner of a lease. Generated per acquisition, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerToken(Uuid);

impl OwnerToken {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OwnerToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Persisted state of one saga instance.
///
/// `document` is the saga state as a JSON object; lookups match a named
/// field inside it. Timestamps are millis since epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub resource_id: ResourceId,
    pub saga_type: String,
    pub created_at: u64,
    pub updated_at: u64,
    pub document: serde_json::Value,
    /// Set by the save that saw the saga complete. A completed record only
    /// waits for deletion and is never hydrated again.
    #[serde(default)]
    pub completed: bool,
}

impl StateRecord {
    /// New record with a fresh resource identity.
    #[must_use]
    pub fn new(saga_type: &str, document: serde_json::Value, now: u64) -> Self {
        Self {
            resource_id: ResourceId::new(),
            saga_type: saga_type.to_string(),
            created_at: now,
            updated_at: now,
            document,
            completed: false,
        }
    }

    /// Applies a fenced save. The completion marker never goes back to
    /// `false`.
    pub fn apply(&mut self, update: StateUpdate, now: u64) {
        self.document = update.document;
        self.completed |= update.completed;
        self.updated_at = now;
    }
}

/// New contents of a record, written by [`StateStore::save`](super::StateStore::save).
#[derive(Debug, Clone, PartialEq)]
pub struct StateUpdate {
    pub document: serde_json::Value,
    pub completed: bool,
}

impl StateUpdate {
    /// Update that marks the saga completed.
    #[must_use]
    pub fn completed(document: serde_json::Value) -> Self {
        Self {
            document,
            completed: true,
        }
    }
}

impl From<serde_json::Value> for StateUpdate {
    fn from(document: serde_json::Value) -> Self {
        Self {
            document,
            completed: false,
        }
    }
}

/// Lease held on one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub resource_id: ResourceId,
    pub owner: OwnerToken,
    /// Absolute expiry, millis since epoch.
    pub expires_at: u64,
}

impl LeaseRecord {
    /// A lease is expired once the clock reaches its expiry.
    #[must_use]
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

/// Proof of lease ownership presented with a state save.
///
/// The store accepts the save only if the lease on `resource_id` is still
/// owned by `owner` and unexpired at `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseFence {
    pub resource_id: ResourceId,
    pub owner: OwnerToken,
    pub now: u64,
}

impl LeaseFence {
    /// Whether `lease` satisfies this fence.
    #[must_use]
    pub fn admits(&self, lease: &LeaseRecord) -> bool {
        lease.resource_id == self.resource_id && lease.owner == self.owner && !lease.is_expired(self.now)
    }
}

/// Result of [`StateStore::create`](super::StateStore::create).
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// The record was inserted.
    Created(StateRecord),
    /// A record for the same correlation key already existed; it is returned
    /// unchanged and nothing was inserted.
    AlreadyExists(StateRecord),
}

impl CreateOutcome {
    /// The record now stored for the key, whichever way it got there.
    #[must_use]
    pub fn into_record(self) -> StateRecord {
        match self {
            Self::Created(record) | Self::AlreadyExists(record) => record,
        }
    }
}

/// Result of [`StateStore::save`](super::StateStore::save).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    /// The fence did not admit the current lease; nothing was written.
    Fenced,
    /// The record no longer exists.
    Missing,
}

/// Store-level consistency failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// More than one stored document matches a correlation key.
    #[error("correlation is not unique: {matches} records match {key}")]
    NotUnique { key: String, matches: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(owner: OwnerToken, expires_at: u64) -> LeaseRecord {
        LeaseRecord {
            resource_id: ResourceId::new(),
            owner,
            expires_at,
        }
    }

    #[test]
    fn lease_expires_at_its_deadline() {
        let l = lease(OwnerToken::new(), 1_000);
        assert!(!l.is_expired(999));
        assert!(l.is_expired(1_000));
        assert!(l.is_expired(5_000));
    }

    #[test]
    fn fence_requires_owner_and_live_lease() {
        let owner = OwnerToken::new();
        let l = lease(owner, 1_000);
        let fence = LeaseFence {
            resource_id: l.resource_id,
            owner,
            now: 500,
        };
        assert!(fence.admits(&l));
        assert!(!LeaseFence { now: 1_000, ..fence }.admits(&l));
        assert!(!LeaseFence {
            owner: OwnerToken::new(),
            ..fence
        }
        .admits(&l));
        assert!(!LeaseFence {
            resource_id: ResourceId::new(),
            ..fence
        }
        .admits(&l));
    }

    #[test]
    fn resource_ids_are_unique_and_serialize_as_strings() {
        let a = ResourceId::new();
        assert_ne!(a, ResourceId::new());
        let json = serde_json::to_value(a).unwrap();
        assert_eq!(json, serde_json::Value::String(a.to_string()));
    }

    #[test]
    fn completion_marker_sticks_once_set() {
        let mut record = StateRecord::new("s", serde_json::json!({"id": "x"}), 1);
        assert!(!record.completed);

        record.apply(StateUpdate::completed(serde_json::json!({"id": "x", "n": 1})), 2);
        assert!(record.completed);
        assert_eq!(record.updated_at, 2);

        record.apply(serde_json::json!({"id": "x", "n": 2}).into(), 3);
        assert!(record.completed);
        assert_eq!(record.document["n"], 2);
    }

    #[test]
    fn records_without_marker_decode_as_live() {
        let record = StateRecord::new("s", serde_json::json!({"id": "x"}), 1);
        let mut json = serde_json::to_value(&record).unwrap();
        json.as_object_mut().unwrap().remove("completed");
        let decoded: StateRecord = serde_json::from_value(json).unwrap();
        assert!(!decoded.completed);
    }

    #[test]
    fn create_outcome_yields_record() {
        let record = StateRecord::new("s", serde_json::json!({"id": "x"}), 7);
        assert_eq!(record.created_at, 7);
        assert_eq!(
            CreateOutcome::AlreadyExists(record.clone()).into_record(),
            record
        );
    }
}
