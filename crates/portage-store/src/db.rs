//! Shared record-store handle and table definitions
//!
//! One redb database file backs every table; each store type borrows a
//! clone of the handle. Tables are created up front so read transactions
//! never race table creation.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, TableDefinition};
use tracing::info;

use crate::error::{StoreError, StoreResult};

/// Parcel metadata keyed by the encoded (sender, message id) pair
pub(crate) const PARCELS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("parcels");

/// Collection receipts keyed by the encoded (recipient, sender, id) triple
pub(crate) const COLLECTION_RECORDS: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new("collection_records");

/// Local endpoints keyed by address
pub(crate) const ENDPOINTS: TableDefinition<&str, &[u8]> = TableDefinition::new("endpoints");

/// Keys and certificates keyed by credential slot name
pub(crate) const CREDENTIALS: TableDefinition<&str, &[u8]> = TableDefinition::new("credentials");

/// Node-level configuration values keyed by name
pub(crate) const NODE_CONFIG: TableDefinition<&str, &[u8]> = TableDefinition::new("node_config");

/// Handle to the gateway's record store
#[derive(Clone)]
pub struct Db {
    inner: Arc<Database>,
}

impl Db {
    /// Open (or create) the database file and ensure all tables exist
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(|e| StoreError::Record(e.to_string()))?;
        let tx = db
            .begin_write()
            .map_err(|e| StoreError::Record(e.to_string()))?;
        {
            tx.open_table(PARCELS)
                .map_err(|e| StoreError::Record(e.to_string()))?;
            tx.open_table(COLLECTION_RECORDS)
                .map_err(|e| StoreError::Record(e.to_string()))?;
            tx.open_table(ENDPOINTS)
                .map_err(|e| StoreError::Record(e.to_string()))?;
            tx.open_table(CREDENTIALS)
                .map_err(|e| StoreError::Record(e.to_string()))?;
            tx.open_table(NODE_CONFIG)
                .map_err(|e| StoreError::Record(e.to_string()))?;
        }
        tx.commit().map_err(|e| StoreError::Record(e.to_string()))?;

        info!(path = %path.display(), "Record store opened");
        Ok(Self {
            inner: Arc::new(db),
        })
    }

    pub(crate) fn begin_write(&self) -> StoreResult<redb::WriteTransaction> {
        self.inner
            .begin_write()
            .map_err(|e| StoreError::Record(e.to_string()))
    }

    pub(crate) fn begin_read(&self) -> StoreResult<redb::ReadTransaction> {
        self.inner
            .begin_read()
            .map_err(|e| StoreError::Record(e.to_string()))
    }
}

/// Map any redb error into the store error type
pub(crate) fn record_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Record(e.to_string())
}
