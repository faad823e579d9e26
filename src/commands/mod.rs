pub mod leader;
pub mod list;
pub mod prune;
pub mod run;
pub mod watch;

use std::path::PathBuf;
use std::sync::Arc;

use clap::ValueEnum;

use crate::config::GuardConfig;
use crate::error::Result;
use crate::logging::TabLog;
use crate::output::Format;
use crate::registry::Registry;
use crate::store::Storage;
use crate::store::files::FileStorage;
use crate::store::sqlite::SqliteStorage;

/// Database file used by the sqlite backend, inside `--dir`.
pub const SQLITE_FILE: &str = "tabs.db";

/// Where the CLI keeps the shared registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// One JSON file per key, guarded by lock files.
    File,
    /// A single SQLite database.
    Sqlite,
}

/// Everything a command needs besides its own flags.
#[derive(Debug, Clone)]
pub struct Context {
    pub dir: PathBuf,
    pub backend: Backend,
    pub config: GuardConfig,
    pub format: Format,
}

impl Context {
    pub fn open_storage(&self) -> Result<Arc<dyn Storage>> {
        let storage: Arc<dyn Storage> = match self.backend {
            Backend::File => Arc::new(FileStorage::open(&self.dir)?),
            Backend::Sqlite => Arc::new(SqliteStorage::open(&self.dir.join(SQLITE_FILE))?),
        };
        Ok(storage)
    }

    /// Direct access to the registry, for commands that do not hold a tab.
    pub fn registry(&self) -> Result<Registry> {
        let log = TabLog::new("cli", "-", self.config.debug);
        Ok(Registry::new(
            self.open_storage()?,
            &self.config.storage_key,
            log,
        ))
    }
}
