use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{GuardError, Result};

/// Pause between attempts while another process holds the lock.
const RETRY_DELAY: Duration = Duration::from_millis(5);

fn open_lock_file(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}

/// Acquire an exclusive lock without waiting; fails with `Locked` if held.
/// The lock is released when the File is dropped.
pub fn try_acquire_lock(path: &Path) -> Result<File> {
    let file = open_lock_file(path)?;
    file.try_lock_exclusive()
        .map_err(|_| GuardError::Locked(path.display().to_string()))?;
    Ok(file)
}

/// Keep trying for up to `wait`. A holder that never lets go (a hung
/// process) surfaces as `Locked` instead of stalling the caller's timers.
pub fn acquire_lock_within(path: &Path, wait: Duration) -> Result<File> {
    let deadline = Instant::now() + wait;
    loop {
        match try_acquire_lock(path) {
            Err(GuardError::Locked(_)) if Instant::now() < deadline => thread::sleep(RETRY_DELAY),
            other => return other,
        }
    }
}

/// Release lock explicitly (normally handled by Drop).
pub fn release_lock(file: File) -> Result<()> {
    file.unlock()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquire_and_release_lock() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("registry.lock");

        let file = try_acquire_lock(&lock_path).unwrap();
        // Held; a non-blocking attempt must fail
        let err = try_acquire_lock(&lock_path).unwrap_err();
        assert_eq!(err.code(), "locked");
        release_lock(file).unwrap();
        let _file = try_acquire_lock(&lock_path).unwrap();
    }

    #[test]
    fn bounded_wait_gives_up() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("registry.lock");
        let _held = try_acquire_lock(&lock_path).unwrap();
        let started = Instant::now();
        let err = acquire_lock_within(&lock_path, Duration::from_millis(30)).unwrap_err();
        assert_eq!(err.code(), "locked");
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn bounded_wait_succeeds_once_released() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("registry.lock");
        let held = try_acquire_lock(&lock_path).unwrap();
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(held);
        });
        acquire_lock_within(&lock_path, Duration::from_secs(5)).unwrap();
        releaser.join().unwrap();
    }
}
