use serde::Serialize;

use crate::store::Storage;
use crate::transport::{BroadcastHub, TransportKind};

/// What the environment offers, probed once when a guard or observer is
/// built. Later decisions read this instead of re-probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub broadcast: bool,
    pub storage_events: bool,
    pub atomic_storage: bool,
}

impl Capabilities {
    pub fn detect(storage: &dyn Storage, hub: Option<&BroadcastHub>) -> Self {
        Self {
            broadcast: hub.is_some_and(BroadcastHub::is_enabled),
            storage_events: storage.supports_change_events(),
            atomic_storage: storage.supports_atomic(),
        }
    }

    /// The transport tier [`crate::transport::open`] will try first.
    pub fn preferred_transport(&self) -> TransportKind {
        if self.broadcast {
            TransportKind::Broadcast
        } else if self.storage_events {
            TransportKind::StorageEvents
        } else {
            TransportKind::Polling
        }
    }
}
