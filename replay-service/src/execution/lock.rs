// Resource Locks
// Keyed mutual exclusion around dependency installation

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Lock key for cells that do not request a runtime version
pub const DEFAULT_LOCK_KEY: &str = "rvm";

/// Errors that can occur while acquiring a lock
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Failed to open lock file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to lock {path}: {source}")]
    Acquire {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Lock task failed: {0}")]
    Task(String),
}

/// Held lock; released when dropped
pub struct LockGuard {
    _held: Box<dyn Send + Sync>,
}

impl LockGuard {
    fn new(held: impl Send + Sync + 'static) -> Self {
        Self {
            _held: Box::new(held),
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").finish_non_exhaustive()
    }
}

/// Trait for keyed exclusive locks
#[async_trait::async_trait]
pub trait ResourceLock: Send + Sync {
    /// Wait until the lock for `key` is exclusively held
    async fn acquire(&self, key: &str) -> Result<LockGuard, LockError>;
}

/// Run `work` while holding the lock for `key`
///
/// The lock is released on every exit path, including when `work` is
/// dropped before completion.
pub async fn with_lock<L, F>(lock: &L, key: &str, work: F) -> Result<F::Output, LockError>
where
    L: ResourceLock + ?Sized,
    F: Future,
{
    let _guard = lock.acquire(key).await?;
    tracing::debug!(key, "lock acquired");
    let output = work.await;
    tracing::debug!(key, "lock released");
    Ok(output)
}

/// In-process locks: one lazily created mutex per key
#[derive(Default)]
pub struct KeyedMutexLock {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedMutexLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(key.to_string()).or_default().clone()
    }
}

#[async_trait::async_trait]
impl ResourceLock for KeyedMutexLock {
    async fn acquire(&self, key: &str) -> Result<LockGuard, LockError> {
        let guard = self.mutex_for(key).lock_owned().await;
        Ok(LockGuard::new(guard))
    }
}

/// File name for a key; anything outside `[A-Za-z0-9._-]` becomes `_`
fn lock_file_name(key: &str) -> String {
    let sanitized: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}.lock", sanitized)
}

/// Advisory file locks in a directory shared by every worker of a run
///
/// Works across processes as well as across tasks of one process, since each
/// acquisition opens its own file description.
#[cfg(unix)]
pub struct FileLock {
    dir: PathBuf,
}

#[cfg(unix)]
impl FileLock {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(lock_file_name(key))
    }

    fn lock_blocking(path: &Path) -> Result<flock::HeldFile, LockError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|source| LockError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        flock::HeldFile::lock(file).map_err(|source| LockError::Acquire {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(unix)]
#[async_trait::async_trait]
impl ResourceLock for FileLock {
    async fn acquire(&self, key: &str) -> Result<LockGuard, LockError> {
        let path = self.path_for(key);
        let held = tokio::task::spawn_blocking(move || Self::lock_blocking(&path))
            .await
            .map_err(|e| LockError::Task(e.to_string()))??;
        Ok(LockGuard::new(held))
    }
}

#[cfg(unix)]
mod flock {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    /// File held under `flock(LOCK_EX)` until dropped
    pub struct HeldFile {
        file: File,
    }

    impl HeldFile {
        pub fn lock(file: File) -> io::Result<Self> {
            loop {
                // SAFETY: the descriptor stays open for the duration of the call
                let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
                if result == 0 {
                    return Ok(Self { file });
                }
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(err);
                }
            }
        }
    }

    impl Drop for HeldFile {
        fn drop(&mut self) {
            // SAFETY: the descriptor is still owned by `self.file`
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }
}

/// Lock used for a run whose scratch directory is `dir`
pub fn run_lock(dir: &Path) -> Arc<dyn ResourceLock> {
    #[cfg(unix)]
    {
        Arc::new(FileLock::new(dir))
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
        Arc::new(KeyedMutexLock::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Runs two holders of `a_key`/`b_key` concurrently and reports the highest
    /// number of holders seen inside the lock at once
    async fn max_overlap(lock: Arc<dyn ResourceLock>, a_key: &str, b_key: &str) -> usize {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for key in [a_key.to_string(), b_key.to_string()] {
            let lock = lock.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                with_lock(lock.as_ref(), &key, async {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        peak.load(Ordering::SeqCst)
    }

    #[test]
    fn test_lock_file_name() {
        assert_eq!(lock_file_name("2.0.0"), "2.0.0.lock");
        assert_eq!(lock_file_name("ruby/2.0 p1"), "ruby_2.0_p1.lock");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_keyed_mutex_same_key_excludes() {
        let lock: Arc<dyn ResourceLock> = Arc::new(KeyedMutexLock::new());
        assert_eq!(max_overlap(lock, "2.0", "2.0").await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_keyed_mutex_different_keys_overlap() {
        let lock: Arc<dyn ResourceLock> = Arc::new(KeyedMutexLock::new());
        assert_eq!(max_overlap(lock, "2.0", "1.9").await, 2);
    }

    #[tokio::test]
    async fn test_released_after_work() {
        let lock = KeyedMutexLock::new();
        with_lock(&lock, "k", async {}).await.unwrap();
        let again = tokio::time::timeout(Duration::from_secs(1), lock.acquire("k")).await;
        assert!(again.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_file_lock_same_key_excludes() {
        let dir = tempfile::tempdir().unwrap();
        let lock: Arc<dyn ResourceLock> = Arc::new(FileLock::new(dir.path()));
        assert_eq!(max_overlap(lock, "2.0", "2.0").await, 1);
        assert!(dir.path().join("2.0.lock").exists());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_file_lock_different_keys_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let lock: Arc<dyn ResourceLock> = Arc::new(FileLock::new(dir.path()));
        assert_eq!(max_overlap(lock, "2.0", "1.9").await, 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_lock_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::new(dir.path().join("gone"));
        assert!(matches!(lock.acquire("x").await, Err(LockError::Open { .. })));
    }
}
