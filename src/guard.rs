//! The lifecycle controller: one [`TabGuard`] per tab wires identity,
//! registry, heartbeat, election and transport together.
//!
//! All protocol work for a tab runs either on the caller's thread (public
//! methods) or on the tab's scheduler (timers and deferred signal handling),
//! serialized by the guard's state lock. Callbacks and observers run after
//! the lock is released, so they may call back into the guard.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::callbacks::{Callbacks, Dispatcher, GuardEvent, Observer, ObserverId};
use crate::capabilities::Capabilities;
use crate::clock::{Clock, SystemClock};
use crate::config::{ConflictPolicy, GuardConfig};
use crate::detector::Detector;
use crate::election::{self, Decision, Departed};
use crate::error::{GuardError, Result};
use crate::heartbeat::Heartbeat;
use crate::host::{HeadlessHost, Host};
use crate::identity::TabId;
use crate::logging::TabLog;
use crate::model::{LeaderState, MessageKind, TabMap, TabMessage, TabRecord};
use crate::observer::TabDiff;
use crate::registry::{self, Registry};
use crate::schedule::{Scheduler, TaskHandle};
use crate::store::{ChangeListener, Storage, StorageEvent};
use crate::subscription::Subscription;
use crate::transport::{self, BroadcastHub, MessageHandler, Transport, TransportKind, TransportSetup};

/// The environment a guard runs against.
#[derive(Clone)]
pub struct Ports {
    pub storage: Arc<dyn Storage>,
    pub clock: Arc<dyn Clock>,
    pub scheduler: Arc<dyn Scheduler>,
    pub hub: Option<BroadcastHub>,
    pub host: Arc<dyn Host>,
}

impl Ports {
    /// System clock, headless host, no broadcast hub.
    pub fn new(storage: Arc<dyn Storage>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            storage,
            clock: Arc::new(SystemClock),
            scheduler,
            hub: None,
            host: Arc::new(HeadlessHost::default()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_hub(mut self, hub: BroadcastHub) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn with_host(mut self, host: Arc<dyn Host>) -> Self {
        self.host = host;
        self
    }
}

/// Point-in-time summary of a guard.
#[derive(Debug, Clone, Serialize)]
pub struct TabStatus {
    pub tab_id: String,
    pub state: LeaderState,
    pub is_active: bool,
    pub running: bool,
    pub destroyed: bool,
    pub visible: bool,
    pub allow_multiple_tabs: bool,
    pub transport: Option<TransportKind>,
    /// The peer this tab yields to, while conflicted.
    pub winner: Option<String>,
    pub live_tabs: usize,
    pub capabilities: Capabilities,
}

/// This tab's identity plus its current registry record, if any.
#[derive(Debug, Clone, Serialize)]
pub struct TabInfo {
    pub id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    pub url: String,
    pub user_agent: String,
    pub state: LeaderState,
    pub is_active: bool,
    pub epoch: u64,
    pub record: Option<TabRecord>,
}

/// How much an evaluation may write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refresh {
    /// Check tick: renew the own heartbeat.
    Stamp,
    /// Signal-driven re-run: write only if something actually changed, so
    /// peers reacting to each other's writes settle instead of ping-ponging.
    IfChanged,
}

#[derive(Default)]
struct State {
    config: GuardConfig,
    detector: Detector,
    running: bool,
    destroyed: bool,
    visible: bool,
    allow_multiple: bool,
    epoch: u64,
    departed: Departed,
    diff: Option<TabDiff>,
    live: TabMap,
    timers: Vec<TaskHandle>,
    subscriptions: Vec<Subscription>,
    transport: Option<Arc<dyn Transport>>,
}

struct Inner {
    ports: Ports,
    capabilities: Capabilities,
    heartbeat: Heartbeat,
    registry: Registry,
    dispatcher: Dispatcher,
    state: Mutex<State>,
    log: TabLog,
}

/// Keeps one tab registered and tells it whether it is the active one.
///
/// Dropping a guard without [`TabGuard::stop`] behaves like a crashed tab:
/// timers and listeners go away, but the registry record stays until peers
/// expire it.
pub struct TabGuard {
    inner: Arc<Inner>,
}

impl TabGuard {
    pub fn new(config: GuardConfig, callbacks: Callbacks, ports: Ports) -> Self {
        Self::with_id(TabId::generate(), config, callbacks, ports)
    }

    pub fn with_id(id: TabId, config: GuardConfig, callbacks: Callbacks, ports: Ports) -> Self {
        let log = TabLog::new("guard", id.as_str(), config.debug);
        let (config, notes) = config.normalized();
        for note in notes {
            log.warn(format!("config: {note}"));
        }
        let capabilities = Capabilities::detect(ports.storage.as_ref(), ports.hub.as_ref());
        log.debug(format!("capabilities {capabilities:?}"));
        if !capabilities.atomic_storage {
            log.debug("storage has no compare-and-set; simultaneous opens settle on the next tick");
        }
        let heartbeat = Heartbeat::new(
            id,
            ports.clock.now(),
            config.url.clone().unwrap_or_else(|| ports.host.url()),
            config
                .user_agent
                .clone()
                .unwrap_or_else(|| ports.host.user_agent()),
        );
        let registry = Registry::new(ports.storage.clone(), &config.storage_key, log.clone());
        let state = State {
            visible: ports.host.is_visible(),
            allow_multiple: config.allow_multiple_tabs,
            diff: config.observe_tabs.then(TabDiff::new),
            config,
            ..State::default()
        };
        Self {
            inner: Arc::new(Inner {
                dispatcher: Dispatcher::new(callbacks, log.clone()),
                ports,
                capabilities,
                heartbeat,
                registry,
                state: Mutex::new(state),
                log,
            }),
        }
    }

    /// Register, open the transport, arm timers, and run the first election.
    /// Starting a running guard is a no-op; a destroyed one cannot restart.
    pub fn start(&self) -> Result<()> {
        self.inner.start()
    }

    /// Leave: cancel timers, drop listeners, delete the own record and tell
    /// peers. Safe to call repeatedly.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// `stop`, then refuse any further start and forget every observer.
    pub fn destroy(&self) {
        self.inner.stop();
        let mut st = self.inner.lock();
        st.destroyed = true;
        st.diff = None;
        drop(st);
        self.inner.dispatcher.observers().clear();
        self.inner.log.debug("destroyed");
    }

    /// Host unload hook. Same as `stop`, best-effort.
    pub fn unload(&self) {
        self.inner.stop();
    }

    /// Run one full check tick now and return the resulting state.
    pub fn check_now(&self) -> LeaderState {
        self.inner.evaluate(Refresh::Stamp);
        self.state()
    }

    /// Take leadership from whichever tab holds it. Peers yield on their next
    /// evaluation; their records are not touched.
    pub fn force_claim(&self) {
        self.inner.force_claim();
    }

    pub fn allow_multiple_tabs(&self) {
        self.inner.set_multiple(true);
    }

    pub fn disallow_multiple_tabs(&self) {
        self.inner.set_multiple(false);
    }

    pub fn visibility_changed(&self, visible: bool) {
        self.inner.visibility_changed(visible);
    }

    pub fn focus_changed(&self, focused: bool) {
        if focused {
            self.inner.log.debug("focused");
            self.inner.evaluate(Refresh::IfChanged);
        }
    }

    pub fn add_observer(&self, observer: impl Fn(&GuardEvent) + Send + Sync + 'static) -> ObserverId {
        let observer: Observer = Arc::new(observer);
        self.inner.dispatcher.observers().add(observer)
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.inner.dispatcher.observers().remove(id)
    }

    pub fn id(&self) -> &TabId {
        self.inner.heartbeat.id()
    }

    pub fn state(&self) -> LeaderState {
        self.inner.lock().detector.state()
    }

    pub fn is_active(&self) -> bool {
        self.state() == LeaderState::Active
    }

    pub fn capabilities(&self) -> Capabilities {
        self.inner.capabilities
    }

    pub fn config(&self) -> GuardConfig {
        self.inner.lock().config.clone()
    }

    /// Replace the configuration of a live guard.
    ///
    /// New check and heartbeat intervals re-arm the running timers at once.
    /// Transport settings take effect on the next `start`. `storage_key`,
    /// `url` and `user_agent` are part of the tab's identity and keep their
    /// original values.
    pub fn update_config(&self, config: GuardConfig) {
        self.inner.update_config(config);
    }

    pub fn status(&self) -> TabStatus {
        let st = self.inner.lock();
        TabStatus {
            tab_id: self.id().to_string(),
            state: st.detector.state(),
            is_active: st.detector.state() == LeaderState::Active,
            running: st.running,
            destroyed: st.destroyed,
            visible: st.visible,
            allow_multiple_tabs: st.allow_multiple,
            transport: st.transport.as_ref().map(|t| t.kind()),
            winner: st.detector.winner().map(str::to_string),
            live_tabs: st.live.len(),
            capabilities: self.inner.capabilities,
        }
    }

    pub fn tab_info(&self) -> TabInfo {
        let hb = &self.inner.heartbeat;
        let record = self.inner.registry.get_one(hb.id().as_str());
        let st = self.inner.lock();
        TabInfo {
            id: hb.id().to_string(),
            created_at: hb.created_at(),
            url: hb.url().to_string(),
            user_agent: hb.user_agent().to_string(),
            state: st.detector.state(),
            is_active: st.detector.state() == LeaderState::Active,
            epoch: st.epoch,
            record,
        }
    }

    /// Live tabs in the registry right now, this one included.
    pub fn tabs(&self) -> TabMap {
        let now = self.inner.ports.clock.now();
        let timeout = self.inner.lock().config.tab_timeout_ms;
        let mut tabs = self.inner.registry.get_all();
        tabs.retain(|_, record| record.is_live(now, timeout));
        tabs
    }

    /// How many live tabs the registry holds.
    pub fn tab_count(&self) -> usize {
        self.tabs().len()
    }

    /// Live tabs that currently consider themselves active.
    pub fn active_tabs(&self) -> Vec<TabRecord> {
        self.tabs()
            .into_values()
            .filter(|record| record.is_active_flag)
            .collect()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn own_id(&self) -> &str {
        self.heartbeat.id().as_str()
    }

    fn start(self: &Arc<Self>) -> Result<()> {
        let events = {
            let mut st = self.lock();
            if st.destroyed {
                return Err(GuardError::Destroyed);
            }
            if st.running {
                return Ok(());
            }
            st.running = true;
            st.visible = self.ports.host.is_visible();

            let transport = transport::open(TransportSetup {
                channel_id: &st.config.channel_id,
                use_broadcast: st.config.use_broadcast_transport,
                use_storage_events: st.config.use_storage_transport,
                poll_interval: st.config.poll_interval(),
                capabilities: &self.capabilities,
                hub: self.ports.hub.as_ref(),
                storage: self.ports.storage.clone(),
                scheduler: self.ports.scheduler.clone(),
                log: &self.log,
            });
            let handler = self.message_handler();
            st.subscriptions.push(transport.on_message(handler));
            if let Some(watch) = self.watch_registry() {
                st.subscriptions.push(watch);
            }
            st.transport = Some(transport);
            let timers = self.arm_timers(&st.config);
            st.timers = timers;

            self.log.debug("started");
            let events = self.evaluate_locked(&mut st, Refresh::Stamp);
            self.send(&st, MessageKind::Announce);
            events
        };
        self.publish(events);
        Ok(())
    }

    /// Check and heartbeat timers, in that order.
    fn arm_timers(self: &Arc<Self>, config: &GuardConfig) -> Vec<TaskHandle> {
        let weak = Arc::downgrade(self);
        let check = self.ports.scheduler.every(
            config.check_interval(),
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.evaluate(Refresh::Stamp);
                }
            }),
        );
        let weak = Arc::downgrade(self);
        let heartbeat = self.ports.scheduler.every(
            config.heartbeat_interval(),
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.beat();
                }
            }),
        );
        vec![check, heartbeat]
    }

    fn update_config(self: &Arc<Self>, config: GuardConfig) {
        let (mut config, notes) = config.normalized();
        for note in notes {
            self.log.warn(format!("config: {note}"));
        }
        let (replaced, running) = {
            let mut st = self.lock();
            let old = &st.config;
            if config.storage_key != old.storage_key
                || config.url != old.url
                || config.user_agent != old.user_agent
            {
                self.log
                    .warn("config: storage_key, url and user_agent cannot change on a live tab");
                config.storage_key = old.storage_key.clone();
                config.url = old.url.clone();
                config.user_agent = old.user_agent.clone();
            }
            let rearm = st.running
                && (config.check_interval_ms != old.check_interval_ms
                    || config.heartbeat_interval_ms != old.heartbeat_interval_ms);
            if config.observe_tabs != old.observe_tabs {
                st.diff = config.observe_tabs.then(TabDiff::new);
            }
            st.allow_multiple = config.allow_multiple_tabs;
            let replaced = if rearm {
                let timers = self.arm_timers(&config);
                std::mem::replace(&mut st.timers, timers)
            } else {
                Vec::new()
            };
            st.config = config;
            (replaced, st.running)
        };
        drop(replaced);
        self.log.debug("config updated");
        if running {
            self.evaluate(Refresh::IfChanged);
        }
    }

    fn stop(&self) {
        let (transport, timers, subscriptions) = {
            let mut st = self.lock();
            if !st.running {
                return;
            }
            st.running = false;
            st.detector.reset();
            st.epoch = 0;
            st.departed.clear();
            st.live.clear();
            if let Some(diff) = st.diff.as_mut() {
                diff.reset();
            }
            (
                st.transport.take(),
                std::mem::take(&mut st.timers),
                std::mem::take(&mut st.subscriptions),
            )
        };
        drop(timers);
        drop(subscriptions);
        self.registry.delete(self.own_id());
        if let Some(transport) = transport {
            let now = self.ports.clock.now();
            transport.send(&self.heartbeat.message(MessageKind::Depart, now));
            transport.close();
        }
        self.log.debug("stopped");
    }

    /// Run the election and deliver whatever it raised.
    fn evaluate(&self, refresh: Refresh) {
        let events = {
            let mut st = self.lock();
            if !st.running {
                return;
            }
            self.evaluate_locked(&mut st, refresh)
        };
        self.publish(events);
    }

    fn evaluate_locked(&self, st: &mut State, refresh: Refresh) -> Vec<GuardEvent> {
        let now = self.ports.clock.now();
        let timeout = st.config.tab_timeout_ms;
        let own = self.own_id();
        let epoch = st.epoch;
        let multiple = st.allow_multiple;
        let departed = &st.departed;

        let outcome = self.registry.update(|map| {
            let pruned = registry::prune(map, now, timeout, Some(own));
            if refresh == Refresh::Stamp || !map.contains_key(own) {
                self.heartbeat.stamp(map, now, epoch);
            }
            let decision = if multiple {
                Decision::Lead
            } else {
                election::decide(own, map, departed)
            };
            if let Some(record) = map.get_mut(own) {
                record.is_active_flag = decision == Decision::Lead;
            }
            (pruned, decision, map.clone())
        });

        let (decision, live) = match outcome {
            Some((pruned, decision, live)) => {
                if !pruned.is_empty() {
                    self.log.debug(format!("pruned {}", pruned.join(", ")));
                }
                (decision, live)
            }
            // Unusable storage: no peers are visible, so this tab leads.
            None => (Decision::Lead, TabMap::new()),
        };

        st.departed
            .retain(|id, seq| live.get(id).is_some_and(|r| r.seq == *seq));
        let transition = st.detector.apply(decision);
        let mut events = transition.events(own);
        if !events.is_empty() {
            self.log.debug(format!("now {}", st.detector.state()));
        }
        if let Some(diff) = st.diff.as_mut() {
            events.extend(diff.apply(live.clone()));
        }
        st.live = live;
        events
    }

    fn beat(&self) {
        let st = self.lock();
        if !st.running {
            return;
        }
        let now = self.ports.clock.now();
        if !self.heartbeat.beat(&self.registry, now, st.epoch) {
            self.log.debug("heartbeat not stored");
        }
        self.send(&st, MessageKind::Heartbeat);
    }

    fn force_claim(&self) {
        let events = {
            let mut st = self.lock();
            if !st.running {
                return;
            }
            let now = self.ports.clock.now();
            let own = self.own_id();
            let claimed = self.registry.update(|map| {
                let epoch = election::next_epoch(map);
                self.heartbeat.stamp(map, now, epoch);
                epoch
            });
            st.epoch = claimed.unwrap_or(st.epoch + 1);
            self.log.debug(format!("{own} claims epoch {}", st.epoch));
            let events = self.evaluate_locked(&mut st, Refresh::Stamp);
            self.send(&st, MessageKind::Announce);
            events
        };
        self.publish(events);
    }

    fn set_multiple(&self, allow: bool) {
        {
            let mut st = self.lock();
            if st.allow_multiple == allow {
                return;
            }
            st.allow_multiple = allow;
        }
        self.log.debug(format!("allow_multiple_tabs = {allow}"));
        self.evaluate(Refresh::IfChanged);
    }

    fn visibility_changed(&self, visible: bool) {
        {
            let mut st = self.lock();
            if st.visible == visible {
                return;
            }
            st.visible = visible;
        }
        self.dispatcher
            .deliver(GuardEvent::VisibilityChanged { visible });
        if visible {
            self.evaluate(Refresh::IfChanged);
        }
    }

    fn send(&self, st: &State, kind: MessageKind) {
        if let Some(transport) = st.transport.as_ref() {
            transport.send(&self.heartbeat.message(kind, self.ports.clock.now()));
        }
    }

    /// Deliver events outside the state lock, applying the conflict policy
    /// right after the conflict callback.
    fn publish(&self, events: Vec<GuardEvent>) {
        for event in events {
            let conflict = matches!(event, GuardEvent::Conflict { .. });
            self.dispatcher.deliver(event);
            if conflict {
                self.apply_policy();
            }
        }
    }

    fn apply_policy(&self) {
        let host = &self.ports.host;
        let config = self.lock().config.clone();
        match config.policy {
            ConflictPolicy::Warn => host.alert(&config.warning_message),
            ConflictPolicy::Redirect => match config.redirect_url.as_deref() {
                Some(url) => host.redirect(url),
                None => host.alert(&config.warning_message),
            },
            ConflictPolicy::Close => host.close(),
        }
    }

    fn on_message(&self, message: &TabMessage) {
        if message.tab_id == self.own_id() {
            return;
        }
        self.log
            .debug(format!("{} from {}", message.kind, message.tab_id));
        // Any other message means the sender is around again.
        let returned = message.kind != MessageKind::Depart
            && self.lock().departed.remove(&message.tab_id).is_some();
        match message.kind {
            MessageKind::Heartbeat if returned => self.evaluate(Refresh::IfChanged),
            MessageKind::Heartbeat => {}
            MessageKind::Announce => {
                {
                    let st = self.lock();
                    if st.running && st.detector.state() == LeaderState::Active {
                        self.send(&st, MessageKind::Ack);
                    }
                }
                self.evaluate(Refresh::IfChanged);
            }
            MessageKind::Depart => {
                {
                    let mut st = self.lock();
                    if let Some(seq) = st.live.get(&message.tab_id).map(|r| r.seq) {
                        st.departed.insert(message.tab_id.clone(), seq);
                    }
                }
                self.evaluate(Refresh::IfChanged);
            }
            MessageKind::Ack => self.evaluate(Refresh::IfChanged),
        }
    }

    /// Transport handler: hop onto this tab's loop before touching state.
    fn message_handler(self: &Arc<Self>) -> MessageHandler {
        let weak: Weak<Self> = Arc::downgrade(self);
        let scheduler = self.ports.scheduler.clone();
        Arc::new(move |message: &TabMessage| {
            let weak = weak.clone();
            let message = message.clone();
            scheduler.defer(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_message(&message);
                }
            }));
        })
    }

    fn watch_registry(self: &Arc<Self>) -> Option<Subscription> {
        if !self.capabilities.storage_events {
            return None;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let key = self.registry.key().to_string();
        let scheduler = self.ports.scheduler.clone();
        let listener: ChangeListener = Arc::new(move |event: &StorageEvent| {
            if event.key != key {
                return;
            }
            let weak = weak.clone();
            scheduler.defer(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.evaluate(Refresh::IfChanged);
                }
            }));
        });
        self.ports.storage.watch(listener)
    }
}
