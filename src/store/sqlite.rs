use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use crate::error::Result;
use crate::store::Storage;

/// SQLite-backed storage: one `kv` table, shared by every process that opens
/// the same database file.
///
/// Compare-and-set runs inside an IMMEDIATE transaction, so the read and the
/// write are atomic across processes.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open (or create) the database at the given file path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA busy_timeout=5000;",
        )?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.create_tables()?;
        Ok(storage)
    }

    /// Open an in-memory database (for tests).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA busy_timeout=5000;")?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.create_tables()?;
        Ok(storage)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn create_tables(&self) -> Result<()> {
        self.conn().execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(())
    }
}

fn read(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
        row.get(0)
    })
    .optional()
}

fn write(conn: &Connection, key: &str, value: Option<&str>) -> rusqlite::Result<()> {
    match value {
        Some(value) => {
            conn.execute(
                "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
                params![key, value, Utc::now().to_rfc3339()],
            )?;
        }
        None => {
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        }
    }
    Ok(())
}

impl Storage for SqliteStorage {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn get_item(&self, key: &str) -> Result<Option<String>> {
        Ok(read(&self.conn(), key)?)
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        Ok(write(&self.conn(), key, Some(value))?)
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        Ok(write(&self.conn(), key, None)?)
    }

    fn supports_atomic(&self) -> bool {
        true
    }

    fn compare_and_set(&self, key: &str, expected: Option<&str>, new: Option<&str>) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = read(&tx, key)?;
        if current.as_deref() != expected {
            return Ok(false);
        }
        write(&tx, key, new)?;
        tx.commit()?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn schema_table_exists() {
        let storage = SqliteStorage::open_memory().unwrap();
        let tables: Vec<String> = storage
            .conn()
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(tables, vec!["kv".to_string()]);
    }

    #[test]
    fn set_get_remove() {
        let storage = SqliteStorage::open_memory().unwrap();
        storage.set_item("k", "1").unwrap();
        storage.set_item("k", "2").unwrap();
        assert_eq!(storage.get_item("k").unwrap().as_deref(), Some("2"));
        storage.remove_item("k").unwrap();
        assert_eq!(storage.get_item("k").unwrap(), None);
    }

    #[test]
    fn compare_and_set_semantics() {
        let storage = SqliteStorage::open_memory().unwrap();
        assert!(storage.compare_and_set("k", None, Some("a")).unwrap());
        assert!(!storage.compare_and_set("k", None, Some("b")).unwrap());
        assert!(storage.compare_and_set("k", Some("a"), Some("b")).unwrap());
        assert!(storage.compare_and_set("k", Some("b"), None).unwrap());
        assert_eq!(storage.get_item("k").unwrap(), None);
    }

    #[test]
    fn file_database_is_shared_between_handles() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("runtime").join("tabs.db");
        let a = SqliteStorage::open(&path).unwrap();
        let b = SqliteStorage::open(&path).unwrap();
        a.set_item("shared", "from-a").unwrap();
        assert_eq!(b.get_item("shared").unwrap().as_deref(), Some("from-a"));
        assert!(b.compare_and_set("shared", Some("from-a"), Some("from-b")).unwrap());
        assert_eq!(a.get_item("shared").unwrap().as_deref(), Some("from-b"));
    }
}
