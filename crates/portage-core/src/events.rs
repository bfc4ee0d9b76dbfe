//! Events and observable states shared between gateway components
//!
//! Live state is published on `tokio::sync::watch` channels owned by the
//! component that produces it; subscribers always observe the last known
//! value first. The enums here are the payloads of those channels and of
//! the endpoint notifier's broadcast bus.

use serde::{Deserialize, Serialize};

use crate::address::PrivateAddress;

/// Event delivered to local-endpoint observers
///
/// Emitted by the sync engines and the cargo processor whenever something
/// a local application cares about lands in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifierEvent {
    /// A parcel for this recipient was stored and awaits collection
    ParcelArrived { recipient: PrivateAddress },
    /// The node's identity certificate was replaced
    IdentityCertificateRotated,
}

/// Whether the public gateway is currently reachable
///
/// Courier runs publish their own state machine and do not flip this;
/// it tracks the continuous internet path only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No usable path to the internet gateway
    #[default]
    Offline,
    /// Continuous internet path to the public gateway
    InternetGateway,
}

/// Whether this node completed its registration with the public gateway
///
/// Persisted in the node config table. All public sync operations are
/// gated on `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RegistrationState {
    #[default]
    NotStarted,
    Done,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        assert_eq!(ConnectionState::default(), ConnectionState::Offline);
        assert_eq!(RegistrationState::default(), RegistrationState::NotStarted);
    }
}
