//! Storage port and the substrates that implement it.
//!
//! A storage scope is the per-origin key-value area every tab of one
//! application shares. Values are opaque strings; the registry and the
//! storage-backed transports put JSON in them.

pub mod files;
pub mod lock;
pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use crate::error::{GuardError, Result};
use crate::subscription::Subscription;

/// A change observed on a shared key, delivered to every connection except
/// the writer's own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

pub type ChangeListener = Arc<dyn Fn(&StorageEvent) + Send + Sync>;

pub trait Storage: Send + Sync {
    /// Short backend name for status output.
    fn name(&self) -> &'static str;

    fn get_item(&self, key: &str) -> Result<Option<String>>;

    fn set_item(&self, key: &str, value: &str) -> Result<()>;

    fn remove_item(&self, key: &str) -> Result<()>;

    fn supports_atomic(&self) -> bool {
        false
    }

    /// Replace the value of `key` with `new` only if it currently equals
    /// `expected`. `None` stands for "absent" on both sides. Returns whether
    /// the swap happened.
    fn compare_and_set(
        &self,
        _key: &str,
        _expected: Option<&str>,
        _new: Option<&str>,
    ) -> Result<bool> {
        Err(GuardError::AtomicUnsupported)
    }

    fn supports_change_events(&self) -> bool {
        false
    }

    /// Register for change notifications. `None` when the backend has none;
    /// callers then fall back to polling.
    fn watch(&self, _listener: ChangeListener) -> Option<Subscription> {
        None
    }
}
