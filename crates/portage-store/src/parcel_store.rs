//! The parcel store: metadata rows plus blob files
//!
//! Metadata lives in the record store keyed by (sender, message id); the
//! sealed parcel bytes live in a blob file next to the database. Writes
//! are blob first (tmp + rename), metadata last, so a cancelled insert
//! never leaves metadata pointing at a half-written blob. Deletes remove
//! metadata first, then the blob.
//!
//! Inserts are broadcast on a channel so the collection channel can
//! stream newly arrived parcels live; session-level de-duplication is the
//! subscriber's responsibility, not the store's.

use std::io::ErrorKind;
use std::path::PathBuf;

use bytes::Bytes;
use redb::ReadableTable;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use portage_core::{ParcelKey, RecipientLocation, StoredParcel};

use crate::db::{Db, PARCELS, record_err};
use crate::error::{StoreError, StoreResult};

/// Capacity of the insert broadcast channel
const EVENT_CAPACITY: usize = 256;

/// Persistent store for parcel metadata and blobs
pub struct ParcelStore {
    db: Db,
    blob_dir: PathBuf,
    events: broadcast::Sender<StoredParcel>,
}

impl ParcelStore {
    /// Open the store, creating the blob directory if needed
    pub async fn open(db: Db, blob_dir: PathBuf) -> StoreResult<Self> {
        fs::create_dir_all(&blob_dir).await?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            db,
            blob_dir,
            events,
        })
    }

    /// The canonical blob file name for a parcel key
    pub fn blob_name(key: &ParcelKey) -> String {
        format!("{}.parcel", hex::encode(blake3::hash(&key.storage_bytes()).as_bytes()))
    }

    /// Insert (or replace) a parcel, writing the blob before the metadata
    pub async fn insert(&self, parcel: StoredParcel, sealed: &[u8]) -> StoreResult<()> {
        let key = parcel.key();
        let blob_path = self.blob_dir.join(&parcel.blob_name);

        // Blob first, atomically
        let tmp_path = blob_path.with_extension("tmp");
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(sealed).await?;
        file.sync_all().await?;
        fs::rename(&tmp_path, &blob_path).await?;

        // Metadata last; remember any replaced row so its blob can go
        let encoded = postcard::to_allocvec(&parcel)?;
        let key_bytes = key.storage_bytes();
        let replaced: Option<StoredParcel> = {
            let tx = self.db.begin_write()?;
            let previous = {
                let mut table = tx.open_table(PARCELS).map_err(record_err)?;
                let previous = table
                    .insert(key_bytes.as_slice(), encoded.as_slice())
                    .map_err(record_err)?
                    .map(|guard| postcard::from_bytes::<StoredParcel>(guard.value()))
                    .transpose()?;
                previous
            };
            tx.commit().map_err(record_err)?;
            previous
        };

        if let Some(old) = replaced {
            if old.blob_name != parcel.blob_name {
                self.remove_blob(&old.blob_name).await;
            }
            debug!(key = %key, "Replaced stored parcel");
        } else {
            debug!(key = %key, size = parcel.size, "Stored parcel");
        }

        // Nobody listening is fine
        let _ = self.events.send(parcel);
        Ok(())
    }

    /// Fetch one parcel's metadata
    pub async fn get(&self, sender: &str, message_id: &str) -> StoreResult<Option<StoredParcel>> {
        let key = ParcelKey::new(sender, message_id).storage_bytes();
        let tx = self.db.begin_read()?;
        let table = tx.open_table(PARCELS).map_err(record_err)?;
        table
            .get(key.as_slice())
            .map_err(record_err)?
            .map(|guard| postcard::from_bytes(guard.value()).map_err(StoreError::from))
            .transpose()
    }

    /// Whether a parcel with this key is stored
    pub async fn contains(&self, key: &ParcelKey) -> StoreResult<bool> {
        Ok(self.get(&key.sender, &key.message_id).await?.is_some())
    }

    /// Delete a parcel's metadata and blob; idempotent
    ///
    /// Returns whether anything was deleted.
    pub async fn delete(&self, key: &ParcelKey) -> StoreResult<bool> {
        let key_bytes = key.storage_bytes();
        let removed: Option<StoredParcel> = {
            let tx = self.db.begin_write()?;
            let removed = {
                let mut table = tx.open_table(PARCELS).map_err(record_err)?;
                table
                    .remove(key_bytes.as_slice())
                    .map_err(record_err)?
                    .map(|guard| postcard::from_bytes::<StoredParcel>(guard.value()))
                    .transpose()?
            };
            tx.commit().map_err(record_err)?;
            removed
        };

        match removed {
            Some(parcel) => {
                self.remove_blob(&parcel.blob_name).await;
                debug!(key = %key, "Deleted parcel");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Read a parcel's sealed bytes
    ///
    /// A missing blob is [`StoreError::BlobMissing`]: the parcel is
    /// unrecoverable and its metadata should be deleted.
    pub async fn load_blob(&self, parcel: &StoredParcel) -> StoreResult<Bytes> {
        let path = self.blob_dir.join(&parcel.blob_name);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StoreError::BlobMissing(parcel.blob_name.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// All parcels waiting on one side of the relay
    pub async fn list_for_location(
        &self,
        location: RecipientLocation,
    ) -> StoreResult<Vec<StoredParcel>> {
        self.scan(|p| p.location == location).await
    }

    /// Parcels for a set of recipients on one side of the relay
    pub async fn list_for_recipients(
        &self,
        recipients: &[String],
        location: RecipientLocation,
    ) -> StoreResult<Vec<StoredParcel>> {
        self.scan(|p| p.location == location && recipients.contains(&p.recipient))
            .await
    }

    /// Subscribe to live parcel inserts
    ///
    /// The receiver observes every insert from subscription onward;
    /// combine with a snapshot for catch-up, de-duplicating per session.
    pub fn subscribe(&self) -> broadcast::Receiver<StoredParcel> {
        self.events.subscribe()
    }

    /// Total stored bytes for one side of the relay
    pub async fn total_size(&self, location: RecipientLocation) -> StoreResult<u64> {
        Ok(self
            .list_for_location(location)
            .await?
            .iter()
            .map(|p| p.size)
            .sum())
    }

    /// Delete every parcel whose expiry has passed
    pub async fn delete_expired(&self, now: chrono::DateTime<chrono::Utc>) -> StoreResult<usize> {
        let expired = self.scan(|p| p.is_expired_at(now)).await?;
        let mut deleted = 0;
        for parcel in &expired {
            if self.delete(&parcel.key()).await? {
                deleted += 1;
            }
        }
        if deleted > 0 {
            debug!(deleted, "Purged expired parcels");
        }
        Ok(deleted)
    }

    async fn scan(
        &self,
        mut keep: impl FnMut(&StoredParcel) -> bool,
    ) -> StoreResult<Vec<StoredParcel>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(PARCELS).map_err(record_err)?;
        let mut out = Vec::new();
        for row in table.iter().map_err(record_err)? {
            let (_, value) = row.map_err(record_err)?;
            let parcel: StoredParcel = postcard::from_bytes(value.value())?;
            if keep(&parcel) {
                out.push(parcel);
            }
        }
        Ok(out)
    }

    async fn remove_blob(&self, blob_name: &str) {
        let path = self.blob_dir.join(blob_name);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(blob = blob_name, error = %e, "Failed to remove blob"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    async fn open_store() -> (ParcelStore, TempDir) {
        let temp = TempDir::new().unwrap();
        let db = Db::open(&temp.path().join("db/gateway.redb")).unwrap();
        let store = ParcelStore::open(db, temp.path().join("blobs")).await.unwrap();
        (store, temp)
    }

    fn parcel(sender: &str, id: &str, location: RecipientLocation) -> StoredParcel {
        let key = ParcelKey::new(sender, id);
        StoredParcel {
            recipient: "0".to_string() + &"cd".repeat(20),
            sender: sender.to_string(),
            message_id: id.to_string(),
            created_at: Utc::now(),
            expires_at: Utc::now() + Duration::hours(1),
            blob_name: ParcelStore::blob_name(&key),
            size: 42,
            location,
        }
    }

    #[tokio::test]
    async fn test_insert_get_delete() {
        let (store, _temp) = open_store().await;
        let p = parcel("s", "m1", RecipientLocation::ExternalGateway);

        store.insert(p.clone(), b"sealed bytes").await.unwrap();
        let loaded = store.get("s", "m1").await.unwrap().unwrap();
        assert_eq!(loaded, p);
        assert_eq!(&store.load_blob(&loaded).await.unwrap()[..], b"sealed bytes");

        assert!(store.delete(&p.key()).await.unwrap());
        assert!(store.get("s", "m1").await.unwrap().is_none());
        // Idempotent
        assert!(!store.delete(&p.key()).await.unwrap());
    }

    #[tokio::test]
    async fn test_same_key_replaces() {
        let (store, _temp) = open_store().await;
        let first = parcel("s", "m1", RecipientLocation::ExternalGateway);
        let mut second = first.clone();
        second.size = 99;

        store.insert(first, b"one").await.unwrap();
        store.insert(second, b"two").await.unwrap();

        let all = store
            .list_for_location(RecipientLocation::ExternalGateway)
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].size, 99);
        assert_eq!(&store.load_blob(&all[0]).await.unwrap()[..], b"two");
    }

    #[tokio::test]
    async fn test_location_partitioning() {
        let (store, _temp) = open_store().await;
        store
            .insert(parcel("s", "in", RecipientLocation::LocalEndpoint), b"a")
            .await
            .unwrap();
        store
            .insert(parcel("s", "out", RecipientLocation::ExternalGateway), b"bb")
            .await
            .unwrap();

        let inbound = store
            .list_for_location(RecipientLocation::LocalEndpoint)
            .await
            .unwrap();
        assert_eq!(inbound.len(), 1);
        assert_eq!(inbound[0].message_id, "in");

        assert_eq!(
            store
                .total_size(RecipientLocation::ExternalGateway)
                .await
                .unwrap(),
            42
        );
    }

    #[tokio::test]
    async fn test_delete_removes_blob_file() {
        let (store, temp) = open_store().await;
        let p = parcel("s", "m1", RecipientLocation::ExternalGateway);
        store.insert(p.clone(), b"sealed").await.unwrap();

        let blob_path = temp.path().join("blobs").join(&p.blob_name);
        assert!(blob_path.exists());
        store.delete(&p.key()).await.unwrap();
        assert!(!blob_path.exists());
    }

    #[tokio::test]
    async fn test_missing_blob_is_typed() {
        let (store, temp) = open_store().await;
        let p = parcel("s", "m1", RecipientLocation::ExternalGateway);
        store.insert(p.clone(), b"sealed").await.unwrap();
        fs::remove_file(temp.path().join("blobs").join(&p.blob_name))
            .await
            .unwrap();

        assert!(matches!(
            store.load_blob(&p).await,
            Err(StoreError::BlobMissing(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribe_sees_inserts() {
        let (store, _temp) = open_store().await;
        let mut rx = store.subscribe();
        let p = parcel("s", "m1", RecipientLocation::LocalEndpoint);
        store.insert(p.clone(), b"x").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().key(), p.key());
    }

    #[tokio::test]
    async fn test_delete_expired() {
        let (store, _temp) = open_store().await;
        let mut stale = parcel("s", "old", RecipientLocation::LocalEndpoint);
        stale.expires_at = Utc::now() - Duration::seconds(1);
        store.insert(stale, b"x").await.unwrap();
        store
            .insert(parcel("s", "fresh", RecipientLocation::LocalEndpoint), b"y")
            .await
            .unwrap();

        assert_eq!(store.delete_expired(Utc::now()).await.unwrap(), 1);
        let remaining = store
            .list_for_location(RecipientLocation::LocalEndpoint)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].message_id, "fresh");
    }
}
