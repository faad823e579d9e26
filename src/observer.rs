//! Live tab-set tracking.
//!
//! [`TabDiff`] turns successive registry snapshots into added / removed /
//! changed events. [`TabObserver`] runs it on its own timer without taking
//! part in the election; a guard with `observe_tabs` embeds the same diff.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::callbacks::{Callbacks, Dispatcher, GuardEvent, Observer, ObserverId};
use crate::config::GuardConfig;
use crate::error::{GuardError, Result};
use crate::guard::Ports;
use crate::identity::TabId;
use crate::logging::TabLog;
use crate::model::{TabMap, TabRecord};
use crate::registry::Registry;
use crate::schedule::TaskHandle;
use crate::store::{ChangeListener, StorageEvent};
use crate::subscription::Subscription;

/// The previous snapshot, and the events that lead from it to the next one.
#[derive(Debug, Default, Clone)]
pub struct TabDiff {
    previous: TabMap,
}

impl TabDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> &TabMap {
        &self.previous
    }

    /// Replace the snapshot with `current`. Returns one `TabAdded` per new
    /// id, one `TabRemoved` per vanished id, then a `TabsChanged` that is
    /// always present.
    pub fn apply(&mut self, current: TabMap) -> Vec<GuardEvent> {
        let mut events = Vec::new();
        for (id, record) in &current {
            if !self.previous.contains_key(id) {
                events.push(GuardEvent::TabAdded {
                    id: id.clone(),
                    record: record.clone(),
                });
            }
        }
        for id in self.previous.keys() {
            if !current.contains_key(id) {
                events.push(GuardEvent::TabRemoved { id: id.clone() });
            }
        }
        events.push(GuardEvent::TabsChanged {
            tabs: current.clone(),
        });
        self.previous = current;
        events
    }

    pub fn reset(&mut self) {
        self.previous.clear();
    }
}

#[derive(Default)]
struct Running {
    timer: Option<TaskHandle>,
    watch: Option<Subscription>,
}

struct ObserverInner {
    config: GuardConfig,
    ports: Ports,
    registry: Registry,
    diff: Mutex<TabDiff>,
    running: Mutex<Running>,
    destroyed: AtomicBool,
    dispatcher: Dispatcher,
    log: TabLog,
}

/// Watches the registry and reports tabs coming and going. Never registers
/// itself.
pub struct TabObserver {
    inner: Arc<ObserverInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl TabObserver {
    pub fn new(config: GuardConfig, callbacks: Callbacks, ports: Ports) -> Self {
        let label = format!("observer-{}", TabId::generate());
        let log = TabLog::new("observer", &label, config.debug);
        let (config, notes) = config.normalized();
        for note in notes {
            log.warn(format!("config: {note}"));
        }
        let registry = Registry::new(ports.storage.clone(), &config.storage_key, log.clone());
        Self {
            inner: Arc::new(ObserverInner {
                dispatcher: Dispatcher::new(callbacks, log.clone()),
                config,
                ports,
                registry,
                diff: Mutex::new(TabDiff::new()),
                running: Mutex::new(Running::default()),
                destroyed: AtomicBool::new(false),
                log,
            }),
        }
    }

    /// Begin watching: one check now, then one per check interval and one
    /// per registry change event.
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.destroyed.load(Ordering::SeqCst) {
            return Err(GuardError::Destroyed);
        }
        {
            let mut running = lock(&inner.running);
            if running.timer.is_some() {
                return Ok(());
            }
            let weak = Arc::downgrade(inner);
            running.timer = Some(inner.ports.scheduler.every(
                inner.config.check_interval(),
                Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.check();
                    }
                }),
            ));
            running.watch = inner.watch_registry();
        }
        inner.log.debug("started");
        inner.check();
        Ok(())
    }

    pub fn stop(&self) {
        let running = std::mem::take(&mut *lock(&self.inner.running));
        if running.timer.is_some() {
            self.inner.log.debug("stopped");
        }
        drop(running);
    }

    pub fn destroy(&self) {
        self.stop();
        self.inner.destroyed.store(true, Ordering::SeqCst);
        self.inner.dispatcher.observers().clear();
        lock(&self.inner.diff).reset();
    }

    /// Run one check right away and return the live tabs.
    pub fn check(&self) -> TabMap {
        self.inner.check()
    }

    /// Live tabs as of the last check.
    pub fn tabs(&self) -> TabMap {
        lock(&self.inner.diff).snapshot().clone()
    }

    pub fn tab(&self, id: &str) -> Option<TabRecord> {
        lock(&self.inner.diff).snapshot().get(id).cloned()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.running).timer.is_some()
    }

    pub fn add_observer(&self, observer: impl Fn(&GuardEvent) + Send + Sync + 'static) -> ObserverId {
        let observer: Observer = Arc::new(observer);
        self.inner.dispatcher.observers().add(observer)
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.inner.dispatcher.observers().remove(id)
    }
}

impl ObserverInner {
    fn check(&self) -> TabMap {
        if self.destroyed.load(Ordering::SeqCst) {
            return TabMap::new();
        }
        let now = self.ports.clock.now();
        let timeout = self.config.tab_timeout_ms;
        let pruned = self.registry.prune_expired(now, timeout);
        if !pruned.is_empty() {
            self.log.debug(format!("pruned {}", pruned.join(", ")));
        }
        // Prune may have failed; never report an expired record as live.
        let mut live = self.registry.get_all();
        live.retain(|_, record| record.is_live(now, timeout));

        let events = lock(&self.diff).apply(live.clone());
        for event in events {
            self.dispatcher.deliver(event);
        }
        live
    }

    fn watch_registry(self: &Arc<Self>) -> Option<Subscription> {
        if !self.ports.storage.supports_change_events() {
            return None;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let key = self.config.storage_key.clone();
        let scheduler = self.ports.scheduler.clone();
        let listener: ChangeListener = Arc::new(move |event: &StorageEvent| {
            if event.key != key {
                return;
            }
            let weak = weak.clone();
            scheduler.defer(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.check();
                }
            }));
        });
        self.ports.storage.watch(listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(id: &str) -> TabRecord {
        TabRecord::new(&TabId::from(id), Utc::now(), "", "")
    }

    fn snapshot(ids: &[&str]) -> TabMap {
        ids.iter().map(|id| (id.to_string(), record(id))).collect()
    }

    fn names(events: &[GuardEvent]) -> Vec<String> {
        events
            .iter()
            .map(|e| match e {
                GuardEvent::TabAdded { id, .. } => format!("+{id}"),
                GuardEvent::TabRemoved { id } => format!("-{id}"),
                other => other.name().to_string(),
            })
            .collect()
    }

    #[test]
    fn diff_reports_additions_then_removals() {
        let mut diff = TabDiff::new();
        assert_eq!(names(&diff.apply(snapshot(&["a"]))), vec!["+a", "tabs_changed"]);
        assert_eq!(
            names(&diff.apply(snapshot(&["a", "b"]))),
            vec!["+b", "tabs_changed"]
        );
        assert_eq!(names(&diff.apply(snapshot(&["b"]))), vec!["-a", "tabs_changed"]);
        assert_eq!(diff.snapshot().len(), 1);
    }

    #[test]
    fn changed_fires_even_without_membership_change() {
        let mut diff = TabDiff::new();
        diff.apply(snapshot(&["a"]));
        assert_eq!(names(&diff.apply(snapshot(&["a"]))), vec!["tabs_changed"]);
    }
}
