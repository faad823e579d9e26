//! Consumer callbacks and typed observers.
//!
//! Every invocation is isolated: a panicking callback is caught, logged, and
//! reported to observers as [`GuardEvent::Error`], and the loop that raised
//! the event carries on.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use crate::logging::TabLog;
use crate::model::{TabMap, TabRecord};

pub type ConflictFn = Arc<dyn Fn(&TabRecord) + Send + Sync>;
pub type NotifyFn = Arc<dyn Fn() + Send + Sync>;
pub type AddedFn = Arc<dyn Fn(&str, &TabRecord) + Send + Sync>;
pub type RemovedFn = Arc<dyn Fn(&str) + Send + Sync>;
pub type ChangedFn = Arc<dyn Fn(&TabMap) + Send + Sync>;
pub type Observer = Arc<dyn Fn(&GuardEvent) + Send + Sync>;

/// Optional per-event callbacks, built fluently:
///
/// ```
/// use solotab::callbacks::Callbacks;
///
/// let callbacks = Callbacks::new()
///     .on_tab_activated(|| println!("active"))
///     .on_tab_conflict(|winner| println!("already open in {}", winner.id));
/// # drop(callbacks);
/// ```
#[derive(Clone, Default)]
pub struct Callbacks {
    conflict: Option<ConflictFn>,
    activated: Option<NotifyFn>,
    deactivated: Option<NotifyFn>,
    added: Option<AddedFn>,
    removed: Option<RemovedFn>,
    changed: Option<ChangedFn>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once per transition into the conflicted state, with the record
    /// of the tab that won.
    pub fn on_tab_conflict(mut self, f: impl Fn(&TabRecord) + Send + Sync + 'static) -> Self {
        self.conflict = Some(Arc::new(f));
        self
    }

    pub fn on_tab_activated(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.activated = Some(Arc::new(f));
        self
    }

    pub fn on_tab_deactivated(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.deactivated = Some(Arc::new(f));
        self
    }

    pub fn on_tab_added(mut self, f: impl Fn(&str, &TabRecord) + Send + Sync + 'static) -> Self {
        self.added = Some(Arc::new(f));
        self
    }

    pub fn on_tab_removed(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.removed = Some(Arc::new(f));
        self
    }

    pub fn on_tabs_changed(mut self, f: impl Fn(&TabMap) + Send + Sync + 'static) -> Self {
        self.changed = Some(Arc::new(f));
        self
    }

    /// Run the callback matching `event`, if one is set.
    fn run(&self, event: &GuardEvent) -> Option<(&'static str, Result<(), String>)> {
        let outcome = match event {
            GuardEvent::Activated { .. } => {
                let f = self.activated.as_ref()?;
                ("on_tab_activated", invoke(|| f()))
            }
            GuardEvent::Deactivated { .. } => {
                let f = self.deactivated.as_ref()?;
                ("on_tab_deactivated", invoke(|| f()))
            }
            GuardEvent::Conflict { winner, .. } => {
                let f = self.conflict.as_ref()?;
                ("on_tab_conflict", invoke(|| f(winner)))
            }
            GuardEvent::TabAdded { id, record } => {
                let f = self.added.as_ref()?;
                ("on_tab_added", invoke(|| f(id.as_str(), record)))
            }
            GuardEvent::TabRemoved { id } => {
                let f = self.removed.as_ref()?;
                ("on_tab_removed", invoke(|| f(id.as_str())))
            }
            GuardEvent::TabsChanged { tabs } => {
                let f = self.changed.as_ref()?;
                ("on_tabs_changed", invoke(|| f(tabs)))
            }
            GuardEvent::VisibilityChanged { .. } | GuardEvent::Error { .. } => return None,
        };
        Some(outcome)
    }
}

/// Everything a guard or observer reports, in one stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GuardEvent {
    Activated { tab_id: String },
    Deactivated { tab_id: String },
    Conflict { tab_id: String, winner: TabRecord },
    TabAdded { id: String, record: TabRecord },
    TabRemoved { id: String },
    TabsChanged { tabs: TabMap },
    VisibilityChanged { visible: bool },
    /// A callback or observer panicked while handling another event.
    Error { context: String, message: String },
}

impl GuardEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Activated { .. } => "activated",
            Self::Deactivated { .. } => "deactivated",
            Self::Conflict { .. } => "conflict",
            Self::TabAdded { .. } => "tab_added",
            Self::TabRemoved { .. } => "tab_removed",
            Self::TabsChanged { .. } => "tabs_changed",
            Self::VisibilityChanged { .. } => "visibility_changed",
            Self::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Registered observers. Emission works on a snapshot, so observers may add
/// or remove observers while handling an event.
#[derive(Default)]
pub struct ObserverSet {
    entries: Mutex<Vec<(ObserverId, Observer)>>,
    next_id: AtomicU64,
}

impl ObserverSet {
    fn lock(&self) -> MutexGuard<'_, Vec<(ObserverId, Observer)>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, observer: Observer) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, observer));
        id
    }

    pub fn remove(&self, id: ObserverId) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|(i, _)| *i != id);
        entries.len() != before
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver to every observer; returns the messages of those that panicked.
    fn emit(&self, event: &GuardEvent) -> Vec<String> {
        let snapshot: Vec<Observer> = self.lock().iter().map(|(_, o)| o.clone()).collect();
        snapshot
            .into_iter()
            .filter_map(|observer| invoke(|| observer(event)).err())
            .collect()
    }
}

/// Callbacks plus observers, delivering each event to both.
pub struct Dispatcher {
    callbacks: Callbacks,
    observers: ObserverSet,
    log: TabLog,
}

impl Dispatcher {
    pub fn new(callbacks: Callbacks, log: TabLog) -> Self {
        Self {
            callbacks,
            observers: ObserverSet::default(),
            log,
        }
    }

    pub fn observers(&self) -> &ObserverSet {
        &self.observers
    }

    pub fn deliver(&self, event: GuardEvent) {
        self.log.debug(format!("event {}", event.name()));
        if let Some((context, Err(message))) = self.callbacks.run(&event) {
            self.log.error(format!("{context} panicked: {message}"));
            self.report(context, message);
        }
        for message in self.observers.emit(&event) {
            self.log
                .error(format!("observer panicked on {}: {message}", event.name()));
            if !matches!(event, GuardEvent::Error { .. }) {
                self.report("observer", message);
            }
        }
    }

    fn report(&self, context: &str, message: String) {
        let event = GuardEvent::Error {
            context: context.to_string(),
            message,
        };
        for message in self.observers.emit(&event) {
            self.log
                .error(format!("observer panicked on error report: {message}"));
        }
    }
}

/// Run `f`, turning a panic into its message.
pub fn invoke(f: impl FnOnce()) -> Result<(), String> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(panic_message)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "callback panicked".to_string()
    }
}
