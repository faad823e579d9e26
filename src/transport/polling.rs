use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GuardError, Result};
use crate::logging::TabLog;
use crate::model::TabMessage;
use crate::schedule::{Scheduler, TaskHandle};
use crate::store::Storage;
use crate::subscription::Subscription;
use crate::transport::{Handlers, MessageHandler, Transport, TransportKind};

/// Messages kept in the shared log; older ones are dropped on append.
const LOG_CAPACITY: usize = 64;
const MAX_APPEND_ATTEMPTS: usize = 16;

#[derive(Debug, Default, Serialize, Deserialize)]
struct MessageLog {
    /// Sequence number the next appended message gets.
    next: u64,
    entries: Vec<LogEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LogEntry {
    seq: u64,
    message: TabMessage,
}

struct PollState {
    storage: Arc<dyn Storage>,
    key: String,
    handlers: Handlers,
    cursor: Mutex<u64>,
    own: Mutex<HashSet<u64>>,
    log: TabLog,
}

/// Messaging for storages without change events: a bounded message log
/// under `<channel>:log`, read on a timer.
///
/// A reader only sees messages appended after it opened, and never its own.
pub struct PollingTransport {
    state: Arc<PollState>,
    timer: Mutex<Option<TaskHandle>>,
}

impl PollingTransport {
    pub fn open(
        storage: Arc<dyn Storage>,
        scheduler: Arc<dyn Scheduler>,
        channel: &str,
        interval: Duration,
        log: TabLog,
    ) -> Self {
        let state = Arc::new(PollState {
            storage,
            key: format!("{channel}:log"),
            handlers: Handlers::default(),
            cursor: Mutex::new(0),
            own: Mutex::new(HashSet::new()),
            log,
        });
        let start = state.read().map(|l| l.next).unwrap_or(0);
        *lock(&state.cursor) = start;

        let weak: Weak<PollState> = Arc::downgrade(&state);
        let timer = scheduler.every(
            interval,
            Box::new(move || {
                if let Some(state) = weak.upgrade() {
                    state.poll();
                }
            }),
        );
        Self {
            state,
            timer: Mutex::new(Some(timer)),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl PollState {
    fn read(&self) -> Result<MessageLog> {
        let raw = self.storage.get_item(&self.key)?;
        Ok(raw
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default())
    }

    fn append(&self, message: &TabMessage) -> Result<u64> {
        let attempts = if self.storage.supports_atomic() {
            MAX_APPEND_ATTEMPTS
        } else {
            1
        };
        for _ in 0..attempts {
            let raw = self.storage.get_item(&self.key)?;
            let mut log: MessageLog = raw
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_default();
            let seq = log.next;
            log.next += 1;
            log.entries.push(LogEntry {
                seq,
                message: message.clone(),
            });
            if log.entries.len() > LOG_CAPACITY {
                let excess = log.entries.len() - LOG_CAPACITY;
                log.entries.drain(..excess);
            }
            let next = serde_json::to_string(&log)?;
            if !self.storage.supports_atomic() {
                self.storage.set_item(&self.key, &next)?;
                return Ok(seq);
            }
            if self
                .storage
                .compare_and_set(&self.key, raw.as_deref(), Some(&next))?
            {
                return Ok(seq);
            }
        }
        Err(GuardError::Contended(self.key.clone()))
    }

    fn poll(&self) {
        if self.handlers.is_closed() {
            return;
        }
        let log = match self.read() {
            Ok(log) => log,
            Err(e) => {
                self.log.warn(format!("poll failed: {e}"));
                return;
            }
        };
        let fresh: Vec<TabMessage> = {
            let mut cursor = lock(&self.cursor);
            // The log was reset underneath us; start over from its beginning.
            if log.next < *cursor {
                *cursor = 0;
            }
            let mut own = lock(&self.own);
            let fresh = log
                .entries
                .into_iter()
                .filter(|e| e.seq >= *cursor && !own.remove(&e.seq))
                .map(|e| e.message)
                .collect();
            // Anything below the new cursor is never read again, including
            // own entries that fell out of the log before this poll.
            own.retain(|seq| *seq >= log.next);
            *cursor = log.next;
            fresh
        };
        for message in &fresh {
            self.handlers.dispatch(message);
        }
    }
}

impl Transport for PollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }

    fn send(&self, message: &TabMessage) {
        if self.state.handlers.is_closed() {
            return;
        }
        match self.state.append(message) {
            Ok(seq) => {
                lock(&self.state.own).insert(seq);
            }
            Err(e) => self
                .state
                .log
                .warn(format!("send {} failed: {e}", message.kind)),
        }
    }

    fn on_message(&self, handler: MessageHandler) -> Subscription {
        self.state.handlers.add(handler)
    }

    fn close(&self) {
        self.state.handlers.close();
        let timer = lock(&self.timer).take();
        drop(timer);
    }
}

impl Drop for PollingTransport {
    fn drop(&mut self) {
        self.close();
    }
}
