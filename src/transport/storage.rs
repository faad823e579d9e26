use std::sync::{Arc, Mutex};

use crate::error::{GuardError, Result};
use crate::logging::TabLog;
use crate::model::TabMessage;
use crate::store::{ChangeListener, Storage, StorageEvent};
use crate::subscription::Subscription;
use crate::transport::{Handlers, MessageHandler, Transport, TransportKind};

/// Messaging over storage change events.
///
/// A send writes the message under the channel key and removes it again at
/// once; peers pick it up from the write's change event. The writer never
/// sees its own write, and the removal carries no value so it is ignored.
pub struct StorageTransport {
    storage: Arc<dyn Storage>,
    key: String,
    handlers: Handlers,
    watch: Mutex<Option<Subscription>>,
    log: TabLog,
}

impl StorageTransport {
    pub fn open(storage: Arc<dyn Storage>, channel: &str, log: TabLog) -> Result<Self> {
        if !storage.supports_change_events() {
            return Err(GuardError::TransportUnavailable(
                "storage_events",
                format!("{} storage has no change events", storage.name()),
            ));
        }
        let key = format!("{channel}:message");
        let handlers = Handlers::default();
        let listener: ChangeListener = {
            let handlers = handlers.clone();
            let key = key.clone();
            let log = log.clone();
            Arc::new(move |event: &StorageEvent| {
                if event.key != key {
                    return;
                }
                let Some(raw) = event.new_value.as_deref() else {
                    return;
                };
                match serde_json::from_str::<TabMessage>(raw) {
                    Ok(message) => handlers.dispatch(&message),
                    Err(e) => log.debug(format!("ignoring malformed message: {e}")),
                }
            })
        };
        let watch = storage.watch(listener).ok_or_else(|| {
            GuardError::TransportUnavailable("storage_events", "watch refused".into())
        })?;
        Ok(Self {
            storage,
            key,
            handlers,
            watch: Mutex::new(Some(watch)),
            log,
        })
    }
}

impl Transport for StorageTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::StorageEvents
    }

    fn send(&self, message: &TabMessage) {
        if self.handlers.is_closed() {
            return;
        }
        let result = serde_json::to_string(message)
            .map_err(GuardError::from)
            .and_then(|raw| self.storage.set_item(&self.key, &raw))
            .and_then(|()| self.storage.remove_item(&self.key));
        if let Err(e) = result {
            self.log.warn(format!("send {} failed: {e}", message.kind));
        }
    }

    fn on_message(&self, handler: MessageHandler) -> Subscription {
        self.handlers.add(handler)
    }

    fn close(&self) {
        self.handlers.close();
        let watch = self
            .watch
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(watch);
    }
}

impl Drop for StorageTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::TabId;
    use crate::model::MessageKind;
    use crate::store::memory::MemoryArea;
    use chrono::Utc;

    fn transport(area: &MemoryArea) -> StorageTransport {
        StorageTransport::open(area.connect(), "ch", TabLog::new("transport", "t", false)).unwrap()
    }

    #[test]
    fn peers_receive_sender_does_not() {
        let area = MemoryArea::new();
        let a = transport(&area);
        let b = transport(&area);
        let seen_a = Arc::new(Mutex::new(Vec::new()));
        let seen_b = Arc::new(Mutex::new(Vec::new()));
        let (sa, sb) = (seen_a.clone(), seen_b.clone());
        let _ha = a.on_message(Arc::new(move |m: &TabMessage| sa.lock().unwrap().push(m.clone())));
        let _hb = b.on_message(Arc::new(move |m: &TabMessage| sb.lock().unwrap().push(m.clone())));

        let msg = TabMessage::new(MessageKind::Announce, &TabId::from("tab_a"), Utc::now());
        a.send(&msg);
        a.send(&msg);
        assert!(seen_a.lock().unwrap().is_empty());
        assert_eq!(*seen_b.lock().unwrap(), vec![msg.clone(), msg]);
        // Nothing left behind under the channel key
        assert_eq!(area.raw("ch:message"), None);
    }

    #[test]
    fn close_stops_delivery() {
        let area = MemoryArea::new();
        let a = transport(&area);
        let b = transport(&area);
        let seen = Arc::new(Mutex::new(0));
        let s = seen.clone();
        let _h = b.on_message(Arc::new(move |_: &TabMessage| *s.lock().unwrap() += 1));
        b.close();
        a.send(&TabMessage::new(MessageKind::Heartbeat, &TabId::from("tab_a"), Utc::now()));
        assert_eq!(*seen.lock().unwrap(), 0);
    }

    #[test]
    fn failing_storage_send_is_swallowed() {
        let area = MemoryArea::new();
        let a = transport(&area);
        area.set_failing(true);
        a.send(&TabMessage::new(MessageKind::Depart, &TabId::from("tab_a"), Utc::now()));
    }
}
