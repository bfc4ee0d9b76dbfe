//! # Portage Store
//!
//! Persistent state for the Portage gateway: the parcel store (record
//! rows plus blob files), collection receipts, the local endpoint
//! registry and its notifier, credential persistence for the identity
//! manager, the cargo staging area, and node-level configuration values.
//!
//! One redb database file backs every table. The parcel store is the
//! only mutable state shared across sync tasks; all mutation goes through
//! its insert/delete operations, which are atomic per key, so callers
//! never take external locks.

pub mod collection_records;
pub mod credentials;
pub mod db;
pub mod endpoints;
pub mod error;
pub mod node_config;
pub mod notifier;
pub mod parcel_store;
pub mod staging;

pub use collection_records::CollectionRecordStore;
pub use credentials::RedbCredentialStore;
pub use db::Db;
pub use endpoints::EndpointRegistry;
pub use error::{StoreError, StoreResult};
pub use node_config::NodeConfigStore;
pub use notifier::EndpointNotifier;
pub use parcel_store::ParcelStore;
pub use staging::{CargoStagingStore, StagedCargo};
