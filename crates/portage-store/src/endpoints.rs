//! Local endpoint registry
//!
//! Tracks the (address, application id) pairs registered on this node.
//! Unique by address; one application may own several endpoint addresses.

use redb::ReadableTable;
use tracing::info;

use portage_core::LocalEndpoint;

use crate::db::{Db, ENDPOINTS, record_err};
use crate::error::StoreResult;

/// Persistent registry of local application endpoints
pub struct EndpointRegistry {
    db: Db,
}

impl EndpointRegistry {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Register (or re-register) an endpoint
    pub async fn register(&self, endpoint: LocalEndpoint) -> StoreResult<()> {
        let value = postcard::to_allocvec(&endpoint)?;
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(ENDPOINTS).map_err(record_err)?;
            table
                .insert(endpoint.address.as_str(), value.as_slice())
                .map_err(record_err)?;
        }
        tx.commit().map_err(record_err)?;
        info!(
            address = %endpoint.address,
            application = %endpoint.application_id,
            "Registered local endpoint"
        );
        Ok(())
    }

    /// Look up an endpoint by address
    pub async fn get(&self, address: &str) -> StoreResult<Option<LocalEndpoint>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(ENDPOINTS).map_err(record_err)?;
        table
            .get(address)
            .map_err(record_err)?
            .map(|guard| postcard::from_bytes(guard.value()).map_err(Into::into))
            .transpose()
    }

    /// Whether an address is registered
    pub async fn contains(&self, address: &str) -> StoreResult<bool> {
        Ok(self.get(address).await?.is_some())
    }

    /// All registered endpoints
    pub async fn list(&self) -> StoreResult<Vec<LocalEndpoint>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(ENDPOINTS).map_err(record_err)?;
        let mut out = Vec::new();
        for row in table.iter().map_err(record_err)? {
            let (_, value) = row.map_err(record_err)?;
            out.push(postcard::from_bytes(value.value())?);
        }
        Ok(out)
    }

    /// Endpoints owned by one application
    pub async fn list_for_application(&self, application_id: &str) -> StoreResult<Vec<LocalEndpoint>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|e| e.application_id == application_id)
            .collect())
    }

    /// Remove an endpoint; returns whether it existed
    pub async fn remove(&self, address: &str) -> StoreResult<bool> {
        let tx = self.db.begin_write()?;
        let existed = {
            let mut table = tx.open_table(ENDPOINTS).map_err(record_err)?;
            table.remove(address).map_err(record_err)?.is_some()
        };
        tx.commit().map_err(record_err)?;
        Ok(existed)
    }
}
