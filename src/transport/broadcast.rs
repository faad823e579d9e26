use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{GuardError, Result};
use crate::model::TabMessage;
use crate::subscription::Subscription;
use crate::transport::{Handlers, MessageHandler, Transport, TransportKind};

struct Endpoint {
    id: u64,
    handlers: Handlers,
}

struct HubInner {
    channels: Mutex<HashMap<String, Vec<Endpoint>>>,
    next_id: AtomicU64,
    enabled: AtomicBool,
}

/// In-process publish/subscribe medium: named channels, one endpoint per
/// participant, delivery to every endpoint except the sender's.
///
/// Tabs that can reach the same hub coordinate over it directly; everyone
/// else falls back to a storage-backed transport.
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                channels: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                enabled: AtomicBool::new(true),
            }),
        }
    }

    /// A disabled hub refuses new endpoints, like a runtime without a
    /// broadcast channel.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Open endpoints on `channel`.
    pub fn participants(&self, channel: &str) -> usize {
        self.channels().get(channel).map_or(0, Vec::len)
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, Vec<Endpoint>>> {
        self.inner.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn join(&self, channel: &str) -> Result<(u64, Handlers)> {
        if !self.is_enabled() {
            return Err(GuardError::TransportUnavailable(
                "broadcast",
                "hub is disabled".into(),
            ));
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let handlers = Handlers::default();
        self.channels()
            .entry(channel.to_string())
            .or_default()
            .push(Endpoint {
                id,
                handlers: handlers.clone(),
            });
        Ok((id, handlers))
    }

    fn leave(&self, channel: &str, endpoint: u64) {
        let mut channels = self.channels();
        if let Some(endpoints) = channels.get_mut(channel) {
            endpoints.retain(|e| e.id != endpoint);
            if endpoints.is_empty() {
                channels.remove(channel);
            }
        }
    }

    fn publish(&self, channel: &str, sender: u64, message: &TabMessage) {
        let targets: Vec<Handlers> = self
            .channels()
            .get(channel)
            .map(|endpoints| {
                endpoints
                    .iter()
                    .filter(|e| e.id != sender)
                    .map(|e| e.handlers.clone())
                    .collect()
            })
            .unwrap_or_default();
        for handlers in targets {
            handlers.dispatch(message);
        }
    }
}

/// One tab's endpoint on a [`BroadcastHub`] channel.
pub struct BroadcastTransport {
    hub: BroadcastHub,
    channel: String,
    endpoint: u64,
    handlers: Handlers,
}

impl BroadcastTransport {
    pub fn open(hub: &BroadcastHub, channel: &str) -> Result<Self> {
        let (endpoint, handlers) = hub.join(channel)?;
        Ok(Self {
            hub: hub.clone(),
            channel: channel.to_string(),
            endpoint,
            handlers,
        })
    }
}

impl Transport for BroadcastTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Broadcast
    }

    fn send(&self, message: &TabMessage) {
        if self.handlers.is_closed() {
            return;
        }
        self.hub.publish(&self.channel, self.endpoint, message);
    }

    fn on_message(&self, handler: MessageHandler) -> Subscription {
        self.handlers.add(handler)
    }

    fn close(&self) {
        if self.handlers.is_closed() {
            return;
        }
        self.handlers.close();
        self.hub.leave(&self.channel, self.endpoint);
    }
}

impl Drop for BroadcastTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::TabId;
    use crate::model::MessageKind;
    use chrono::Utc;

    fn collector() -> (Arc<Mutex<Vec<TabMessage>>>, MessageHandler) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let handler: MessageHandler =
            Arc::new(move |m: &TabMessage| s.lock().unwrap().push(m.clone()));
        (seen, handler)
    }

    fn message(kind: MessageKind, from: &str) -> TabMessage {
        TabMessage::new(kind, &TabId::from(from), Utc::now())
    }

    #[test]
    fn delivers_to_peers_not_sender() {
        let hub = BroadcastHub::new();
        let a = BroadcastTransport::open(&hub, "ch").unwrap();
        let b = BroadcastTransport::open(&hub, "ch").unwrap();
        let (seen_a, ha) = collector();
        let (seen_b, hb) = collector();
        let _sa = a.on_message(ha);
        let _sb = b.on_message(hb);

        a.send(&message(MessageKind::Announce, "tab_a"));
        assert!(seen_a.lock().unwrap().is_empty());
        assert_eq!(seen_b.lock().unwrap()[0].kind, MessageKind::Announce);
    }

    #[test]
    fn channels_are_isolated() {
        let hub = BroadcastHub::new();
        let a = BroadcastTransport::open(&hub, "one").unwrap();
        let b = BroadcastTransport::open(&hub, "two").unwrap();
        let (seen, handler) = collector();
        let _sub = b.on_message(handler);
        a.send(&message(MessageKind::Heartbeat, "tab_a"));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn close_detaches_endpoint() {
        let hub = BroadcastHub::new();
        let a = BroadcastTransport::open(&hub, "ch").unwrap();
        let b = BroadcastTransport::open(&hub, "ch").unwrap();
        let (seen, handler) = collector();
        let _sub = b.on_message(handler);
        assert_eq!(hub.participants("ch"), 2);

        b.close();
        b.close();
        a.send(&message(MessageKind::Depart, "tab_a"));
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(hub.participants("ch"), 1);

        drop(a);
        assert_eq!(hub.participants("ch"), 0);
    }

    #[test]
    fn disabled_hub_refuses_to_open() {
        let hub = BroadcastHub::new();
        hub.set_enabled(false);
        let err = BroadcastTransport::open(&hub, "ch").err().unwrap();
        assert_eq!(err.code(), "transport_unavailable");
    }
}
