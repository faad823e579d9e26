//! Tab-to-tab messaging.
//!
//! Three tiers, tried in order by [`open`]: an in-process broadcast hub,
//! storage change events, and a polled message log kept in storage. Sends
//! are best-effort; failures are logged and never reach the caller.

pub mod broadcast;
pub mod polling;
pub mod storage;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::Serialize;

use crate::capabilities::Capabilities;
use crate::logging::TabLog;
use crate::model::TabMessage;
use crate::schedule::Scheduler;
use crate::store::Storage;
use crate::subscription::Subscription;

pub use broadcast::{BroadcastHub, BroadcastTransport};
pub use polling::PollingTransport;
pub use storage::StorageTransport;

pub type MessageHandler = Arc<dyn Fn(&TabMessage) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Broadcast,
    StorageEvents,
    Polling,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Broadcast => write!(f, "broadcast"),
            Self::StorageEvents => write!(f, "storage_events"),
            Self::Polling => write!(f, "polling"),
        }
    }
}

pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Deliver `message` to every other participant on the channel.
    fn send(&self, message: &TabMessage);

    fn on_message(&self, handler: MessageHandler) -> Subscription;

    /// Release the channel. No handler runs afterwards.
    fn close(&self);
}

/// Everything [`open`] needs to pick and build a transport.
pub struct TransportSetup<'a> {
    pub channel_id: &'a str,
    pub use_broadcast: bool,
    pub use_storage_events: bool,
    pub poll_interval: Duration,
    pub capabilities: &'a Capabilities,
    pub hub: Option<&'a BroadcastHub>,
    pub storage: Arc<dyn Storage>,
    pub scheduler: Arc<dyn Scheduler>,
    pub log: &'a TabLog,
}

/// Open the best available transport. Polling is the tier of last resort and
/// always succeeds.
pub fn open(setup: TransportSetup<'_>) -> Arc<dyn Transport> {
    if setup.use_broadcast && setup.capabilities.broadcast {
        if let Some(hub) = setup.hub {
            match BroadcastTransport::open(hub, setup.channel_id) {
                Ok(transport) => {
                    setup.log.debug("using broadcast transport");
                    return Arc::new(transport);
                }
                Err(e) => setup.log.debug(format!("broadcast unavailable: {e}")),
            }
        }
    }
    if setup.use_storage_events && setup.capabilities.storage_events {
        match StorageTransport::open(setup.storage.clone(), setup.channel_id, setup.log.clone())
        {
            Ok(transport) => {
                setup.log.debug("using storage-event transport");
                return Arc::new(transport);
            }
            Err(e) => setup.log.debug(format!("storage events unavailable: {e}")),
        }
    }
    setup.log.debug("using polling transport");
    Arc::new(PollingTransport::open(
        setup.storage,
        setup.scheduler,
        setup.channel_id,
        setup.poll_interval,
        setup.log.clone(),
    ))
}

// ---------------------------------------------------------------------------
// Handler bookkeeping shared by the transports
// ---------------------------------------------------------------------------

#[derive(Default)]
struct HandlerList {
    entries: Mutex<Vec<(u64, MessageHandler)>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// Registered message handlers, cleared for good on close.
#[derive(Clone, Default)]
pub(crate) struct Handlers {
    inner: Arc<HandlerList>,
}

impl Handlers {
    fn lock(&self) -> MutexGuard<'_, Vec<(u64, MessageHandler)>> {
        self.inner.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn add(&self, handler: MessageHandler) -> Subscription {
        if self.is_closed() {
            return Subscription::noop();
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().push((id, handler));
        let weak: Weak<HandlerList> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner
                    .entries
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .retain(|(i, _)| *i != id);
            }
        })
    }

    pub(crate) fn dispatch(&self, message: &TabMessage) {
        if self.is_closed() {
            return;
        }
        let targets: Vec<MessageHandler> = self.lock().iter().map(|(_, h)| h.clone()).collect();
        for handler in targets {
            handler(message);
        }
    }

    pub(crate) fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.lock().clear();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}
