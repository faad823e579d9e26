use std::sync::{Arc, Mutex};
use std::time::Duration;

use solotab::clock::ManualClock;
use solotab::schedule::ManualScheduler;
use solotab::store::Storage;
use solotab::store::files::FileStorage;
use solotab::store::memory::MemoryArea;
use solotab::{Callbacks, GuardConfig, GuardEvent, Ports, TabGuard, TabId, TabObserver};
use tempfile::tempdir;

fn membership(events: &[GuardEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            GuardEvent::TabAdded { id, .. } => Some(format!("+{id}")),
            GuardEvent::TabRemoved { id } => Some(format!("-{id}")),
            _ => None,
        })
        .collect()
}

fn recorder() -> (Arc<Mutex<Vec<GuardEvent>>>, impl Fn(&GuardEvent) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |e: &GuardEvent| sink.lock().unwrap().push(e.clone()))
}

#[test]
fn test_observer_follows_tabs_coming_and_going() {
    let clock = ManualClock::fixed();
    let sched = ManualScheduler::new(clock.clone());
    let area = MemoryArea::new();
    let ports = |storage: Arc<dyn Storage>| {
        Ports::new(storage, sched.clone()).with_clock(Arc::new(clock.clone()))
    };

    let removed = Arc::new(Mutex::new(Vec::new()));
    let r = removed.clone();
    let callbacks = Callbacks::new().on_tab_removed(move |id| r.lock().unwrap().push(id.to_string()));
    let observer = TabObserver::new(GuardConfig::tab_observer(), callbacks, ports(area.connect()));
    let (seen, sink) = recorder();
    observer.add_observer(sink);

    let a = TabGuard::with_id(
        TabId::from("tab_a"),
        GuardConfig::default(),
        Callbacks::new(),
        ports(area.connect()),
    );
    a.start().unwrap();
    observer.start().unwrap();
    assert!(observer.is_running());
    assert_eq!(observer.tabs().keys().collect::<Vec<_>>(), vec!["tab_a"]);

    let b = TabGuard::with_id(
        TabId::from("tab_b"),
        GuardConfig::default(),
        Callbacks::new(),
        ports(area.connect()),
    );
    b.start().unwrap();
    sched.run_pending();
    assert_eq!(observer.tabs().len(), 2);

    a.destroy();
    sched.run_pending();
    assert_eq!(observer.tabs().keys().collect::<Vec<_>>(), vec!["tab_b"]);
    assert!(observer.tab("tab_a").is_none());

    let events = seen.lock().unwrap().clone();
    assert_eq!(membership(&events), vec!["+tab_a", "+tab_b", "-tab_a"]);
    assert!(events.iter().any(|e| e.name() == "tabs_changed"));
    assert_eq!(*removed.lock().unwrap(), vec!["tab_a"]);

    observer.destroy();
    assert!(!observer.is_running());
    assert_eq!(observer.start().unwrap_err().code(), "destroyed");
    b.destroy();
    assert_eq!(sched.live_timers(), 0);
}

#[test]
fn test_observer_polls_storage_without_change_events() {
    let dir = tempdir().unwrap();
    let clock = ManualClock::fixed();
    let sched = ManualScheduler::new(clock.clone());
    let ports = || {
        let storage: Arc<dyn Storage> = Arc::new(FileStorage::open(dir.path()).unwrap());
        Ports::new(storage, sched.clone()).with_clock(Arc::new(clock.clone()))
    };

    let observer = TabObserver::new(GuardConfig::tab_observer(), Callbacks::new(), ports());
    let (seen, sink) = recorder();
    observer.add_observer(sink);
    observer.start().unwrap();
    assert!(observer.tabs().is_empty());

    let a = TabGuard::with_id(TabId::from("tab_a"), GuardConfig::default(), Callbacks::new(), ports());
    a.start().unwrap();
    assert!(observer.tabs().is_empty(), "not seen until the next check");
    sched.advance(Duration::from_millis(1000));
    assert!(observer.tab("tab_a").is_some());

    // Crash: the record expires and the observer prunes it.
    drop(a);
    sched.advance(Duration::from_millis(7000));
    assert!(observer.tabs().is_empty());
    assert_eq!(membership(&seen.lock().unwrap()), vec!["+tab_a", "-tab_a"]);
}

#[test]
fn test_guard_with_observe_tabs_reports_peers() {
    let clock = ManualClock::fixed();
    let sched = ManualScheduler::new(clock.clone());
    let area = MemoryArea::new();
    let open = |id: &str| {
        let ports = Ports::new(area.connect(), sched.clone()).with_clock(Arc::new(clock.clone()));
        TabGuard::with_id(TabId::from(id), GuardConfig::full_manager(), Callbacks::new(), ports)
    };
    let a = open("tab_a");
    let (seen, sink) = recorder();
    a.add_observer(sink);
    a.start().unwrap();
    let b = open("tab_b");
    b.start().unwrap();
    sched.run_pending();
    b.stop();
    sched.run_pending();

    let events = seen.lock().unwrap().clone();
    assert_eq!(events[0].name(), "activated");
    assert_eq!(membership(&events), vec!["+tab_a", "+tab_b", "-tab_b"]);
    assert!(a.is_active());
}
