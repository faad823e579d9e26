//! Single-active-tab coordination over shared storage.
//!
//! Every tab registers in a shared registry, renews a heartbeat, and runs a
//! leaderless election against the live records it can see. One tab ends up
//! active; the rest are told they conflict and apply a policy. A companion
//! observer reports the live tab set as it changes.

pub mod build_info;
pub mod callbacks;
pub mod capabilities;
pub mod clock;
pub mod commands;
pub mod config;
pub mod detector;
pub mod election;
pub mod error;
pub mod guard;
pub mod heartbeat;
pub mod host;
pub mod identity;
pub mod logging;
pub mod model;
pub mod observer;
pub mod output;
pub mod registry;
pub mod schedule;
pub mod store;
pub mod subscription;
pub mod transport;

pub use callbacks::{Callbacks, GuardEvent};
pub use config::{ConflictPolicy, GuardConfig};
pub use error::{GuardError, Result};
pub use guard::{Ports, TabGuard};
pub use identity::TabId;
pub use model::{LeaderState, TabRecord};
pub use observer::TabObserver;
