use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

/// The page (or process) a guard runs in: where it is, whether anyone is
/// looking at it, and the UI actions a conflict policy may take.
pub trait Host: Send + Sync {
    fn url(&self) -> String;

    fn user_agent(&self) -> String;

    fn is_visible(&self) -> bool {
        true
    }

    fn alert(&self, message: &str);

    fn redirect(&self, url: &str);

    fn close(&self);
}

/// A host with no UI. Policy actions are recorded so callers can inspect
/// what would have happened.
#[derive(Debug)]
pub struct HeadlessHost {
    url: String,
    user_agent: String,
    visible: AtomicBool,
    alerts: Mutex<Vec<String>>,
    redirects: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl Default for HeadlessHost {
    fn default() -> Self {
        Self::new("about:blank")
    }
}

impl HeadlessHost {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            user_agent: format!("solotab/{}", env!("CARGO_PKG_VERSION")),
            visible: AtomicBool::new(true),
            alerts: Mutex::new(Vec::new()),
            redirects: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::SeqCst);
    }

    pub fn alerts(&self) -> Vec<String> {
        lock(&self.alerts).clone()
    }

    pub fn redirects(&self) -> Vec<String> {
        lock(&self.redirects).clone()
    }

    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Host for HeadlessHost {
    fn url(&self) -> String {
        self.url.clone()
    }

    fn user_agent(&self) -> String {
        self.user_agent.clone()
    }

    fn is_visible(&self) -> bool {
        self.visible.load(Ordering::SeqCst)
    }

    fn alert(&self, message: &str) {
        lock(&self.alerts).push(message.to_string());
    }

    fn redirect(&self, url: &str) {
        lock(&self.redirects).push(url.to_string());
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
