//! Collection receipts: parcels already acknowledged to their sender
//!
//! When a cargo-borne parcel is ingested (or rejected as invalid but
//! still owed a receipt), a record is written here. The ingestion
//! duplicate check consults this table so a re-delivered parcel is never
//! processed twice, and cargo generation reads it to emit the
//! acknowledgement items. Records are purged when they expire or on
//! gateway migration.

use chrono::{DateTime, Utc};
use redb::ReadableTable;
use tracing::debug;

use portage_core::CollectionRecord;

use crate::db::{COLLECTION_RECORDS, Db, record_err};
use crate::error::{StoreError, StoreResult};

/// Persistent store for collection receipts
pub struct CollectionRecordStore {
    db: Db,
}

impl CollectionRecordStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Insert (or refresh) a receipt
    pub async fn insert(&self, record: CollectionRecord) -> StoreResult<()> {
        let key = record.storage_bytes();
        let value = postcard::to_allocvec(&record)?;
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(COLLECTION_RECORDS).map_err(record_err)?;
            table
                .insert(key.as_slice(), value.as_slice())
                .map_err(record_err)?;
        }
        tx.commit().map_err(record_err)?;
        Ok(())
    }

    /// Whether a receipt exists for this (recipient, sender, id) triple
    pub async fn contains(
        &self,
        recipient: &str,
        sender: &str,
        message_id: &str,
    ) -> StoreResult<bool> {
        let key = CollectionRecord::key_bytes(recipient, sender, message_id);
        let tx = self.db.begin_read()?;
        let table = tx.open_table(COLLECTION_RECORDS).map_err(record_err)?;
        Ok(table.get(key.as_slice()).map_err(record_err)?.is_some())
    }

    /// All receipts still pending acknowledgement, skipping expired ones
    pub async fn list_pending(&self, now: DateTime<Utc>) -> StoreResult<Vec<CollectionRecord>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(COLLECTION_RECORDS).map_err(record_err)?;
        let mut out = Vec::new();
        for row in table.iter().map_err(record_err)? {
            let (_, value) = row.map_err(record_err)?;
            let record: CollectionRecord = postcard::from_bytes(value.value())?;
            if !record.is_expired_at(now) {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Delete every receipt past its expiry
    pub async fn delete_expired(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        self.purge(|record| record.is_expired_at(now)).await
    }

    /// Drop every receipt, used on gateway migration
    pub async fn purge_all(&self) -> StoreResult<usize> {
        self.purge(|_| true).await
    }

    async fn purge(&self, mut drop: impl FnMut(&CollectionRecord) -> bool) -> StoreResult<usize> {
        let doomed: Vec<Vec<u8>> = {
            let tx = self.db.begin_read()?;
            let table = tx.open_table(COLLECTION_RECORDS).map_err(record_err)?;
            let mut keys = Vec::new();
            for row in table.iter().map_err(record_err)? {
                let (key, value) = row.map_err(record_err)?;
                let record: CollectionRecord = postcard::from_bytes(value.value())?;
                if drop(&record) {
                    keys.push(key.value().to_vec());
                }
            }
            keys
        };
        if doomed.is_empty() {
            return Ok(0);
        }

        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(COLLECTION_RECORDS).map_err(record_err)?;
            for key in &doomed {
                table.remove(key.as_slice()).map_err(record_err)?;
            }
        }
        tx.commit().map_err(record_err)?;
        debug!(purged = doomed.len(), "Purged collection records");
        Ok(doomed.len())
    }
}
