use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::{GuardError, Result};
use crate::logging::TabLog;
use crate::model::{TabMap, TabRecord};
use crate::store::Storage;

/// Compare-and-set attempts before an update gives up for this round.
const MAX_CAS_ATTEMPTS: usize = 16;

/// The shared tab registry: one JSON object under one storage key, mapping
/// tab id to [`TabRecord`].
///
/// Every operation degrades instead of failing. Unreadable data reads as an
/// empty registry and storage errors are logged and dropped, so a tab on a
/// broken storage simply sees no peers.
pub struct Registry {
    storage: Arc<dyn Storage>,
    key: String,
    log: TabLog,
}

impl Registry {
    pub fn new(storage: Arc<dyn Storage>, key: &str, log: TabLog) -> Self {
        Self {
            storage,
            key: key.to_string(),
            log,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Every record currently stored, expired ones included.
    pub fn get_all(&self) -> TabMap {
        match self.storage.get_item(&self.key) {
            Ok(raw) => self.parse(raw.as_deref()),
            Err(e) => {
                self.log.warn(format!("registry read failed: {e}"));
                TabMap::new()
            }
        }
    }

    pub fn get_one(&self, id: &str) -> Option<TabRecord> {
        self.get_all().remove(id)
    }

    /// Insert or replace one record.
    pub fn put(&self, record: TabRecord) {
        self.update(|map| {
            map.insert(record.id.clone(), record.clone());
        });
    }

    pub fn delete(&self, id: &str) {
        self.update(|map| {
            map.remove(id);
        });
    }

    /// Remove records whose heartbeat is older than `timeout_ms`. Returns the
    /// removed ids (empty when nothing expired or the storage failed).
    pub fn prune_expired(&self, now: DateTime<Utc>, timeout_ms: u64) -> Vec<String> {
        self.update(|map| prune(map, now, timeout_ms, None))
            .unwrap_or_default()
    }

    /// Read-modify-write of the whole registry.
    ///
    /// Atomic storages run `f` inside a compare-and-set loop, so `f` may be
    /// called more than once and must only touch the map it is given. Other
    /// storages get a plain read then write. `None` means the change could
    /// not be stored; the failure has already been logged.
    pub fn update<T>(&self, mut f: impl FnMut(&mut TabMap) -> T) -> Option<T> {
        let result = if self.storage.supports_atomic() {
            self.update_atomic(&mut f)
        } else {
            self.update_plain(&mut f)
        };
        match result {
            Ok(out) => Some(out),
            Err(e) => {
                self.log.warn(format!("registry update failed: {e}"));
                None
            }
        }
    }

    fn update_atomic<T>(&self, f: &mut impl FnMut(&mut TabMap) -> T) -> Result<T> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let raw = self.storage.get_item(&self.key)?;
            let mut map = self.parse(raw.as_deref());
            let out = f(&mut map);
            let next = serialize(&map)?;
            if next == raw {
                return Ok(out);
            }
            if self
                .storage
                .compare_and_set(&self.key, raw.as_deref(), next.as_deref())?
            {
                return Ok(out);
            }
            self.log
                .debug(format!("registry write lost a race (attempt {attempt})"));
        }
        Err(GuardError::Contended(self.key.clone()))
    }

    fn update_plain<T>(&self, f: &mut impl FnMut(&mut TabMap) -> T) -> Result<T> {
        let raw = self.storage.get_item(&self.key)?;
        let mut map = self.parse(raw.as_deref());
        let out = f(&mut map);
        match serialize(&map)? {
            next if next == raw => {}
            Some(next) => self.storage.set_item(&self.key, &next)?,
            None => self.storage.remove_item(&self.key)?,
        }
        Ok(out)
    }

    /// Decode the stored value. Entries that do not parse as records are
    /// skipped; anything that is not a JSON object reads as empty.
    fn parse(&self, raw: Option<&str>) -> TabMap {
        let Some(raw) = raw else {
            return TabMap::new();
        };
        let entries: Map<String, Value> = match serde_json::from_str(raw) {
            Ok(entries) => entries,
            Err(e) => {
                self.log
                    .warn(format!("registry data unreadable, treating as empty: {e}"));
                return TabMap::new();
            }
        };
        let mut map = TabMap::new();
        for (id, value) in entries {
            match serde_json::from_value::<TabRecord>(value) {
                Ok(record) => {
                    map.insert(id, record);
                }
                Err(e) => self.log.debug(format!("skipping bad record {id}: {e}")),
            }
        }
        map
    }
}

/// Drop expired records from `map`, never touching `keep`. Returns the ids
/// removed.
pub fn prune(
    map: &mut TabMap,
    now: DateTime<Utc>,
    timeout_ms: u64,
    keep: Option<&str>,
) -> Vec<String> {
    let expired: Vec<String> = map
        .iter()
        .filter(|(id, record)| Some(id.as_str()) != keep && !record.is_live(now, timeout_ms))
        .map(|(id, _)| id.clone())
        .collect();
    for id in &expired {
        map.remove(id);
    }
    expired
}

/// An empty registry is stored as an absent key.
fn serialize(map: &TabMap) -> Result<Option<String>> {
    if map.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(map)?))
}
