use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::error::{GuardError, Result};
use crate::store::{ChangeListener, Storage, StorageEvent};
use crate::subscription::Subscription;

struct Listener {
    id: u64,
    connection: u64,
    callback: ChangeListener,
}

#[derive(Default)]
struct AreaInner {
    data: Mutex<HashMap<String, String>>,
    listeners: Mutex<Vec<Listener>>,
    next_id: AtomicU64,
    quota: Mutex<Option<usize>>,
    failing: AtomicBool,
    no_atomic: AtomicBool,
}

/// An in-process shared storage area, the equivalent of one origin's
/// `localStorage`.
///
/// Each tab takes its own [`MemoryStorage`] connection via [`MemoryArea::connect`].
/// Writes through one connection raise change events on every other
/// connection, never on the writer's.
#[derive(Clone, Default)]
pub struct MemoryArea {
    inner: Arc<AreaInner>,
}

impl MemoryArea {
    pub fn new() -> Self {
        Self::default()
    }

    /// Area that rejects writes once the stored bytes would exceed `bytes`.
    pub fn with_quota(bytes: usize) -> Self {
        let area = Self::default();
        *lock(&area.inner.quota) = Some(bytes);
        area
    }

    pub fn connect(&self) -> Arc<MemoryStorage> {
        Arc::new(MemoryStorage {
            area: self.clone(),
            connection: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
        })
    }

    /// Make every operation fail, as a disabled storage would.
    pub fn set_failing(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::SeqCst);
    }

    /// Withdraw compare-and-set, leaving plain reads and writes. Takes effect
    /// for guards built afterwards.
    pub fn set_atomic(&self, atomic: bool) {
        self.inner.no_atomic.store(!atomic, Ordering::SeqCst);
    }

    /// Read a key without going through a connection.
    pub fn raw(&self, key: &str) -> Option<String> {
        lock(&self.inner.data).get(key).cloned()
    }

    /// Write a key from outside any tab; every connection is notified.
    pub fn put_raw(&self, key: &str, value: &str) {
        let old = lock(&self.inner.data).insert(key.to_string(), value.to_string());
        self.notify(
            u64::MAX,
            StorageEvent {
                key: key.to_string(),
                old_value: old,
                new_value: Some(value.to_string()),
            },
        );
    }

    fn check_available(&self) -> Result<()> {
        if self.inner.failing.load(Ordering::SeqCst) {
            return Err(GuardError::StorageUnavailable("storage disabled".into()));
        }
        Ok(())
    }

    fn check_quota(&self, data: &HashMap<String, String>, key: &str, value: &str) -> Result<()> {
        let Some(quota) = *lock(&self.inner.quota) else {
            return Ok(());
        };
        let used: usize = data
            .iter()
            .filter(|(k, _)| k.as_str() != key)
            .map(|(k, v)| k.len() + v.len())
            .sum();
        if used + key.len() + value.len() > quota {
            return Err(GuardError::QuotaExceeded(key.to_string()));
        }
        Ok(())
    }

    fn notify(&self, writer: u64, event: StorageEvent) {
        if event.old_value == event.new_value {
            return;
        }
        let targets: Vec<ChangeListener> = lock(&self.inner.listeners)
            .iter()
            .filter(|l| l.connection != writer)
            .map(|l| l.callback.clone())
            .collect();
        for callback in targets {
            callback(&event);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// One tab's connection to a [`MemoryArea`].
pub struct MemoryStorage {
    area: MemoryArea,
    connection: u64,
}

impl MemoryStorage {
    fn apply(&self, key: &str, new: Option<&str>) -> Result<Option<String>> {
        let mut data = lock(&self.area.inner.data);
        match new {
            Some(value) => {
                self.area.check_quota(&data, key, value)?;
                Ok(data.insert(key.to_string(), value.to_string()))
            }
            None => Ok(data.remove(key)),
        }
    }
}

impl Storage for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get_item(&self, key: &str) -> Result<Option<String>> {
        self.area.check_available()?;
        Ok(self.area.raw(key))
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.area.check_available()?;
        let old = self.apply(key, Some(value))?;
        self.area.notify(
            self.connection,
            StorageEvent {
                key: key.to_string(),
                old_value: old,
                new_value: Some(value.to_string()),
            },
        );
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        self.area.check_available()?;
        let old = self.apply(key, None)?;
        self.area.notify(
            self.connection,
            StorageEvent {
                key: key.to_string(),
                old_value: old,
                new_value: None,
            },
        );
        Ok(())
    }

    fn supports_atomic(&self) -> bool {
        !self.area.inner.no_atomic.load(Ordering::SeqCst)
    }

    fn compare_and_set(&self, key: &str, expected: Option<&str>, new: Option<&str>) -> Result<bool> {
        self.area.check_available()?;
        if !self.supports_atomic() {
            return Err(GuardError::AtomicUnsupported);
        }
        let old = {
            let mut data = lock(&self.area.inner.data);
            if data.get(key).map(String::as_str) != expected {
                return Ok(false);
            }
            match new {
                Some(value) => {
                    self.area.check_quota(&data, key, value)?;
                    data.insert(key.to_string(), value.to_string())
                }
                None => data.remove(key),
            }
        };
        self.area.notify(
            self.connection,
            StorageEvent {
                key: key.to_string(),
                old_value: old,
                new_value: new.map(str::to_string),
            },
        );
        Ok(true)
    }

    fn supports_change_events(&self) -> bool {
        true
    }

    fn watch(&self, listener: ChangeListener) -> Option<Subscription> {
        let id = self.area.inner.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.area.inner.listeners).push(Listener {
            id,
            connection: self.connection,
            callback: listener,
        });
        let weak: Weak<AreaInner> = Arc::downgrade(&self.area.inner);
        Some(Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                lock(&inner.listeners).retain(|l| l.id != id);
            }
        }))
    }
}
