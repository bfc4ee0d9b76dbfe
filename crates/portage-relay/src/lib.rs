//! Relay engines for the Portage gateway node
//!
//! Everything between the store and the outside world lives here: the
//! shared parcel ingestion pipeline, the cargo codec that packs parcels
//! for courier transport, the continuous public-gateway sync, and the
//! courier run state machine. Remote peers are reached through the
//! [`clients`] traits; `http_gateway` and `tcp_courier` are the real
//! transports, [`mock`] the in-memory test doubles.

pub mod cargo_codec;
pub mod clients;
pub mod courier_sync;
pub mod error;
pub mod http_gateway;
pub mod ingestion;
pub mod mock;
pub mod public_sync;
pub mod tcp_courier;

pub use cargo_codec::{CargoCodec, CargoProcessOutcome, DEFAULT_MAX_CARGO_SIZE};
pub use clients::{
    CollectedParcel, CourierClient, CourierDetector, DeliveryOutcome, GatewayClient,
    GatewayRegistration, ParcelCollection, SyncMode,
};
pub use courier_sync::{CourierSyncEngine, CourierSyncState, QUIESCENT_WAIT};
pub use error::{ClientError, CourierSyncError, RelayError, RelayResult};
pub use http_gateway::{HttpGatewayClient, KEEP_ALIVE_HEADER, NodeRegistrationRequest};
pub use ingestion::{CLOCK_SKEW_MINUTES, IngestOutcome, ParcelDescriptor, ParcelIngestor};
pub use public_sync::PublicSyncEngine;
pub use tcp_courier::{ConfiguredCourierDetector, CourierFrame, TcpCourierClient};
