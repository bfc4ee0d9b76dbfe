//! Endpoint notifier: the event bus toward local applications
//!
//! Both sync engines and the cargo processor publish here whenever a
//! parcel lands for a local endpoint or the node's certificate changes.
//! The local control server relays these to connected collection
//! channels; anything else (push notifications) subscribes the same way.

use tokio::sync::broadcast;
use tracing::debug;

use portage_core::NotifierEvent;

/// Capacity of the notifier's broadcast channel
const NOTIFIER_CAPACITY: usize = 256;

/// Broadcast bus for endpoint-facing events
#[derive(Clone)]
pub struct EndpointNotifier {
    tx: broadcast::Sender<NotifierEvent>,
}

impl EndpointNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTIFIER_CAPACITY);
        Self { tx }
    }

    /// Publish an event; a missing audience is not an error
    pub fn notify(&self, event: NotifierEvent) {
        debug!(?event, "Notifier event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotifierEvent> {
        self.tx.subscribe()
    }
}

impl Default for EndpointNotifier {
    fn default() -> Self {
        Self::new()
    }
}
