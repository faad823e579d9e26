use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::store::Storage;
use crate::store::lock;

/// Longest a write waits for another process's lock on the same key.
const LOCK_WAIT: Duration = Duration::from_secs(2);

/// Directory-backed storage shared by every process pointed at the same root.
///
/// Each key is one JSON file. Writes take a per-key `fs2` lock and replace the
/// file via rename, so readers never observe a half-written value. No change
/// events: peers on this backend coordinate by polling.
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Open (creating if needed) a storage directory.
    pub fn open(root: &Path) -> Result<Self> {
        let storage = Self {
            root: root.to_path_buf(),
        };
        storage.ensure_dirs()?;
        Ok(storage)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(self.locks_dir())?;
        Ok(())
    }

    // -- path helpers -------------------------------------------------------

    fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    /// Path of the file holding `key`.
    pub fn key_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", file_stem(key)))
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.locks_dir().join(format!("{}.lock", file_stem(key)))
    }

    fn tmp_path(&self, key: &str) -> PathBuf {
        self.root
            .join(format!(".{}.{}.tmp", file_stem(key), std::process::id()))
    }

    // -- raw io -------------------------------------------------------------

    fn read(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.key_path(key)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: &str, value: Option<&str>) -> Result<()> {
        match value {
            Some(value) => {
                let tmp = self.tmp_path(key);
                fs::write(&tmp, value)?;
                fs::rename(&tmp, self.key_path(key))?;
            }
            None => match fs::remove_file(self.key_path(key)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            },
        }
        Ok(())
    }

    fn locked_write(&self, key: &str, value: Option<&str>) -> Result<()> {
        let lock = lock::acquire_lock_within(&self.lock_path(key), LOCK_WAIT)?;
        self.write(key, value)?;
        lock::release_lock(lock)?;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn name(&self) -> &'static str {
        "file"
    }

    fn get_item(&self, key: &str) -> Result<Option<String>> {
        self.read(key)
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.locked_write(key, Some(value))
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        self.locked_write(key, None)
    }

    fn supports_atomic(&self) -> bool {
        true
    }

    fn compare_and_set(&self, key: &str, expected: Option<&str>, new: Option<&str>) -> Result<bool> {
        let lock = lock::acquire_lock_within(&self.lock_path(key), LOCK_WAIT)?;
        let current = self.read(key)?;
        if current.as_deref() != expected {
            lock::release_lock(lock)?;
            return Ok(false);
        }
        self.write(key, new)?;
        lock::release_lock(lock)?;
        Ok(true)
    }
}

/// Map an arbitrary key onto a safe file stem.
fn file_stem(key: &str) -> String {
    let stem: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    match stem.trim_start_matches('.') {
        "" => "_".to_string(),
        trimmed => trimmed.to_string(),
    }
}
