//! Durable [`StateStore`] implementation backed by an embedded `redb` file.
//!
//! Records and leases are stored as JSON in two tables keyed by resource id.
//! Every mutation is a single write transaction; redb serializes write
//! transactions, which makes `create` and the conditional lease operations
//! atomic. Blocking file I/O runs on the tokio blocking pool.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use simplebus_core::CorrelationKey;

use crate::storage::record::{
    CreateOutcome, LeaseFence, LeaseRecord, OwnerToken, ResourceId, SaveOutcome, StateRecord,
    StateUpdate, StoreError,
};
use crate::storage::store::StateStore;

const STATES: TableDefinition<&str, &[u8]> = TableDefinition::new("saga_states");
const LEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("saga_leases");

/// File-backed state store. Saga state survives process restarts.
#[derive(Clone)]
pub struct RedbStateStore {
    db: Arc<Database>,
}

impl RedbStateStore {
    /// Opens (or creates) the store at `path` and ensures both tables exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or is not a redb database.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let db = Database::create(path)?;
        create_tables(&db)?;
        Ok(Self { db: Arc::new(db) })
    }

    async fn blocking<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db)).await?
    }
}

fn create_tables(db: &Database) -> anyhow::Result<()> {
    let txn = db.begin_write()?;
    txn.open_table(STATES)?;
    txn.open_table(LEASES)?;
    txn.commit()?;
    Ok(())
}

fn matching<T>(table: &T, key: &CorrelationKey) -> anyhow::Result<Option<StateRecord>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let mut found = Vec::new();
    for item in table.iter()? {
        let (_, bytes) = item?;
        let record: StateRecord = serde_json::from_slice(bytes.value())?;
        if record.saga_type == key.saga_type && key.matches_document(&record.document) {
            found.push(record);
        }
    }
    if found.len() > 1 {
        return Err(StoreError::NotUnique {
            key: key.to_string(),
            matches: found.len(),
        }
        .into());
    }
    Ok(found.pop())
}

fn read_lease<T>(table: &T, id: &str) -> anyhow::Result<Option<LeaseRecord>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(id)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(bytes.value())?)),
        None => Ok(None),
    }
}

#[async_trait]
impl StateStore for RedbStateStore {
    async fn initialize(&self) -> anyhow::Result<()> {
        self.blocking(create_tables).await
    }

    async fn get(&self, key: &CorrelationKey) -> anyhow::Result<Option<StateRecord>> {
        let key = key.clone();
        self.blocking(move |db| {
            let txn = db.begin_read()?;
            let table = txn.open_table(STATES)?;
            matching(&table, &key)
        })
        .await
    }

    async fn create(
        &self,
        key: &CorrelationKey,
        record: StateRecord,
    ) -> anyhow::Result<CreateOutcome> {
        let key = key.clone();
        self.blocking(move |db| {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(STATES)?;
                if let Some(existing) = matching(&table, &key)? {
                    return Ok(CreateOutcome::AlreadyExists(existing));
                }
                let bytes = serde_json::to_vec(&record)?;
                table.insert(record.resource_id.to_string().as_str(), bytes.as_slice())?;
            }
            txn.commit()?;
            Ok(CreateOutcome::Created(record))
        })
        .await
    }

    async fn save(
        &self,
        resource_id: &ResourceId,
        update: StateUpdate,
        fence: &LeaseFence,
        now: u64,
    ) -> anyhow::Result<SaveOutcome> {
        let id = resource_id.to_string();
        let fence = *fence;
        self.blocking(move |db| {
            let txn = db.begin_write()?;
            {
                let leases = txn.open_table(LEASES)?;
                match read_lease(&leases, &id)? {
                    Some(lease) if fence.admits(&lease) => {}
                    _ => return Ok(SaveOutcome::Fenced),
                }

                let mut states = txn.open_table(STATES)?;
                let current: Option<StateRecord> = match states.get(id.as_str())? {
                    Some(bytes) => Some(serde_json::from_slice(bytes.value())?),
                    None => None,
                };
                let Some(mut record) = current else {
                    return Ok(SaveOutcome::Missing);
                };
                record.apply(update, now);
                let bytes = serde_json::to_vec(&record)?;
                states.insert(id.as_str(), bytes.as_slice())?;
            }
            txn.commit()?;
            Ok(SaveOutcome::Saved)
        })
        .await
    }

    async fn delete(&self, resource_id: &ResourceId) -> anyhow::Result<bool> {
        let id = resource_id.to_string();
        self.blocking(move |db| {
            let txn = db.begin_write()?;
            let removed = txn.open_table(STATES)?.remove(id.as_str())?.is_some();
            txn.commit()?;
            Ok(removed)
        })
        .await
    }

    async fn find_lease(&self, resource_id: &ResourceId) -> anyhow::Result<Option<LeaseRecord>> {
        let id = resource_id.to_string();
        self.blocking(move |db| {
            let txn = db.begin_read()?;
            let table = txn.open_table(LEASES)?;
            read_lease(&table, &id)
        })
        .await
    }

    async fn insert_lease(&self, lease: LeaseRecord) -> anyhow::Result<bool> {
        self.blocking(move |db| {
            let id = lease.resource_id.to_string();
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(LEASES)?;
                if read_lease(&table, &id)?.is_some() {
                    return Ok(false);
                }
                let bytes = serde_json::to_vec(&lease)?;
                table.insert(id.as_str(), bytes.as_slice())?;
            }
            txn.commit()?;
            Ok(true)
        })
        .await
    }

    async fn delete_lease_if_expires(
        &self,
        resource_id: &ResourceId,
        expires_at: u64,
    ) -> anyhow::Result<bool> {
        let id = resource_id.to_string();
        self.blocking(move |db| {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(LEASES)?;
                match read_lease(&table, &id)? {
                    Some(lease) if lease.expires_at == expires_at => {
                        table.remove(id.as_str())?;
                    }
                    _ => return Ok(false),
                }
            }
            txn.commit()?;
            Ok(true)
        })
        .await
    }

    async fn delete_lease_if_owner(
        &self,
        resource_id: &ResourceId,
        owner: &OwnerToken,
    ) -> anyhow::Result<bool> {
        let id = resource_id.to_string();
        let owner = *owner;
        self.blocking(move |db| {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(LEASES)?;
                match read_lease(&table, &id)? {
                    Some(lease) if lease.owner == owner => {
                        table.remove(id.as_str())?;
                    }
                    _ => return Ok(false),
                }
            }
            txn.commit()?;
            Ok(true)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use simplebus_core::CorrelationValue;

    use super::*;

    fn key(value: i64) -> CorrelationKey {
        CorrelationKey {
            saga_type: "test.saga",
            field: "seq".to_string(),
            value: CorrelationValue::from(value),
        }
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");

        let resource = {
            let store = RedbStateStore::open(&path).unwrap();
            let record = StateRecord::new("test.saga", json!({ "seq": 42, "note": "first" }), 1);
            store.create(&key(42), record).await.unwrap().into_record().resource_id
        };

        let store = RedbStateStore::open(&path).unwrap();
        store.initialize().await.unwrap();
        let found = store.get(&key(42)).await.unwrap().unwrap();
        assert_eq!(found.resource_id, resource);
        assert_eq!(found.document["note"], "first");
        assert!(store.get(&key(7)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_is_insert_if_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbStateStore::open(dir.path().join("s.redb")).unwrap();
        let first = store
            .create(&key(1), StateRecord::new("test.saga", json!({ "seq": 1 }), 1))
            .await
            .unwrap();
        let second = store
            .create(&key(1), StateRecord::new("test.saga", json!({ "seq": 1 }), 2))
            .await
            .unwrap();
        assert!(matches!(first, CreateOutcome::Created(_)));
        assert_eq!(second, CreateOutcome::AlreadyExists(first.into_record()));
    }

    #[tokio::test]
    async fn fenced_save_and_lease_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbStateStore::open(dir.path().join("s.redb")).unwrap();
        let record = store
            .create(&key(5), StateRecord::new("test.saga", json!({ "seq": 5, "n": 0 }), 1))
            .await
            .unwrap()
            .into_record();
        let lease = LeaseRecord {
            resource_id: record.resource_id,
            owner: OwnerToken::new(),
            expires_at: 100,
        };
        let fence = LeaseFence {
            resource_id: record.resource_id,
            owner: lease.owner,
            now: 50,
        };

        assert_eq!(
            store.save(&record.resource_id, json!({ "seq": 5, "n": 1 }).into(), &fence, 50).await.unwrap(),
            SaveOutcome::Fenced
        );
        assert!(store.insert_lease(lease.clone()).await.unwrap());
        assert!(!store.insert_lease(lease.clone()).await.unwrap());
        assert_eq!(
            store.save(&record.resource_id, json!({ "seq": 5, "n": 1 }).into(), &fence, 50).await.unwrap(),
            SaveOutcome::Saved
        );
        assert_eq!(store.get(&key(5)).await.unwrap().unwrap().document["n"], 1);

        assert!(!store.delete_lease_if_expires(&record.resource_id, 99).await.unwrap());
        assert!(store.delete_lease_if_expires(&record.resource_id, 100).await.unwrap());
        assert!(store.find_lease(&record.resource_id).await.unwrap().is_none());

        store.insert_lease(lease.clone()).await.unwrap();
        assert!(!store
            .delete_lease_if_owner(&record.resource_id, &OwnerToken::new())
            .await
            .unwrap());
        assert!(store
            .delete_lease_if_owner(&record.resource_id, &lease.owner)
            .await
            .unwrap());

        assert!(store.delete(&record.resource_id).await.unwrap());
        assert!(store.get(&key(5)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn completion_marker_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("done.redb");
        {
            let store = RedbStateStore::open(&path).unwrap();
            let record = store
                .create(&key(9), StateRecord::new("test.saga", json!({ "seq": 9 }), 1))
                .await
                .unwrap()
                .into_record();
            let owner = OwnerToken::new();
            store
                .insert_lease(LeaseRecord {
                    resource_id: record.resource_id,
                    owner,
                    expires_at: 100,
                })
                .await
                .unwrap();
            let fence = LeaseFence {
                resource_id: record.resource_id,
                owner,
                now: 10,
            };
            let outcome = store
                .save(&record.resource_id, StateUpdate::completed(json!({ "seq": 9 })), &fence, 10)
                .await
                .unwrap();
            assert_eq!(outcome, SaveOutcome::Saved);
        }

        let store = RedbStateStore::open(&path).unwrap();
        assert!(store.get(&key(9)).await.unwrap().unwrap().completed);
    }
}
