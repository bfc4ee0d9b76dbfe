//! Persisted node-level state
//!
//! Holds the values that must survive restarts but are not user data:
//! the upstream registration state and the address of the gateway the
//! node registered with (so migration to a different gateway can be
//! detected and the collection records purged).

use redb::ReadableTable;

use portage_core::RegistrationState;

use crate::db::{Db, NODE_CONFIG, record_err};
use crate::error::StoreResult;

const REGISTRATION_STATE_KEY: &str = "registration_state";
const REGISTERED_GATEWAY_KEY: &str = "registered_gateway";

/// Accessor for persisted node configuration values
pub struct NodeConfigStore {
    db: Db,
}

impl NodeConfigStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Whether this node completed registration with the public gateway
    pub async fn registration_state(&self) -> StoreResult<RegistrationState> {
        match self.get_raw(REGISTRATION_STATE_KEY).await? {
            Some(bytes) => Ok(postcard::from_bytes(&bytes)?),
            None => Ok(RegistrationState::default()),
        }
    }

    pub async fn set_registration_state(&self, state: RegistrationState) -> StoreResult<()> {
        self.set_raw(REGISTRATION_STATE_KEY, &postcard::to_allocvec(&state)?)
            .await
    }

    /// The public gateway address this node registered with, if any
    pub async fn registered_gateway(&self) -> StoreResult<Option<String>> {
        match self.get_raw(REGISTERED_GATEWAY_KEY).await? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn set_registered_gateway(&self, address: &str) -> StoreResult<()> {
        self.set_raw(REGISTERED_GATEWAY_KEY, &postcard::to_allocvec(&address)?)
            .await
    }

    async fn get_raw(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(NODE_CONFIG).map_err(record_err)?;
        Ok(table
            .get(key)
            .map_err(record_err)?
            .map(|guard| guard.value().to_vec()))
    }

    async fn set_raw(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(NODE_CONFIG).map_err(record_err)?;
            table.insert(key, value).map_err(record_err)?;
        }
        tx.commit().map_err(record_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_registration_state_defaults_and_persists() {
        let temp = TempDir::new().unwrap();
        let db = Db::open(&temp.path().join("gateway.redb")).unwrap();
        let config = NodeConfigStore::new(db.clone());

        assert_eq!(
            config.registration_state().await.unwrap(),
            RegistrationState::NotStarted
        );
        config
            .set_registration_state(RegistrationState::Done)
            .await
            .unwrap();

        let reopened = NodeConfigStore::new(db);
        assert_eq!(
            reopened.registration_state().await.unwrap(),
            RegistrationState::Done
        );
    }

    #[tokio::test]
    async fn test_registered_gateway() {
        let temp = TempDir::new().unwrap();
        let db = Db::open(&temp.path().join("gateway.redb")).unwrap();
        let config = NodeConfigStore::new(db);

        assert!(config.registered_gateway().await.unwrap().is_none());
        config
            .set_registered_gateway("gateway.example.com:443")
            .await
            .unwrap();
        assert_eq!(
            config.registered_gateway().await.unwrap().unwrap(),
            "gateway.example.com:443"
        );
    }
}
