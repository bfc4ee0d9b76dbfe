//! Record-store backed credential persistence
//!
//! Implements the crypto crate's [`CredentialStore`] over the shared
//! database so keys and certificates survive restarts alongside the
//! parcel tables.

use async_trait::async_trait;
use redb::ReadableTable;

use portage_crypto::{CredentialSlot, CredentialStore, CryptoError, CryptoResult};

use crate::db::{CREDENTIALS, Db};

/// Credential storage in the gateway's record store
pub struct RedbCredentialStore {
    db: Db,
}

impl RedbCredentialStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CredentialStore for RedbCredentialStore {
    async fn load(&self, slot: CredentialSlot) -> CryptoResult<Option<Vec<u8>>> {
        let tx = self
            .db
            .begin_read()
            .map_err(|e| CryptoError::CredentialStore(e.to_string()))?;
        let table = tx
            .open_table(CREDENTIALS)
            .map_err(|e| CryptoError::CredentialStore(e.to_string()))?;
        Ok(table
            .get(slot.name())
            .map_err(|e| CryptoError::CredentialStore(e.to_string()))?
            .map(|guard| guard.value().to_vec()))
    }

    async fn save(&self, slot: CredentialSlot, bytes: &[u8]) -> CryptoResult<()> {
        let tx = self
            .db
            .begin_write()
            .map_err(|e| CryptoError::CredentialStore(e.to_string()))?;
        {
            let mut table = tx
                .open_table(CREDENTIALS)
                .map_err(|e| CryptoError::CredentialStore(e.to_string()))?;
            table
                .insert(slot.name(), bytes)
                .map_err(|e| CryptoError::CredentialStore(e.to_string()))?;
        }
        tx.commit()
            .map_err(|e| CryptoError::CredentialStore(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, slot: CredentialSlot) -> CryptoResult<()> {
        let tx = self
            .db
            .begin_write()
            .map_err(|e| CryptoError::CredentialStore(e.to_string()))?;
        {
            let mut table = tx
                .open_table(CREDENTIALS)
                .map_err(|e| CryptoError::CredentialStore(e.to_string()))?;
            table
                .remove(slot.name())
                .map_err(|e| CryptoError::CredentialStore(e.to_string()))?;
        }
        tx.commit()
            .map_err(|e| CryptoError::CredentialStore(e.to_string()))?;
        Ok(())
    }
}
