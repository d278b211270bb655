//! Per-host mutual exclusion

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::errors::AgentError;
use crate::filesys::lock::FileLock;

/// Exclusive hold on one host; released on drop
#[derive(Debug)]
pub struct HostGuard {
    host: String,
    // Declared first so the file lock is released before the in-process one
    _file: Option<FileLock>,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for HostGuard {
    fn drop(&mut self) {
        debug!("Released deployment lock for {}", self.host);
    }
}

/// One async mutex per target host, optionally backed by a lock file per host.
///
/// The mutex orders waiters inside this process; the lock file keeps a second
/// agent process working from the same base directory off the host.
#[derive(Debug, Default)]
pub struct HostLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    lock_dir: Option<PathBuf>,
}

impl HostLocks {
    /// Locks that only exclude deployments within this process
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks that also exclude other processes using `lock_dir`
    pub fn with_lock_dir(lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            locks: Mutex::default(),
            lock_dir: Some(lock_dir.into()),
        }
    }

    /// Lock file guarding `host`, when cross-process locking is on
    pub fn lock_file(&self, host: &str) -> Option<PathBuf> {
        self.lock_dir.as_deref().map(|dir| lock_file_in(dir, host))
    }

    fn lock_for(&self, host: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to `host`.
    ///
    /// A busy host queues the caller; waiters in this process are served in
    /// FIFO order. Fails only when the lock file cannot be opened.
    pub async fn acquire(&self, host: &str) -> Result<HostGuard, AgentError> {
        let lock = self.lock_for(host);
        let guard = match lock.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                let contention = AgentError::LockContention(format!(
                    "deployment already in progress on {}",
                    host
                ));
                info!("{}; queueing", contention);
                lock.lock_owned().await
            }
        };
        let file = match self.lock_file(host) {
            Some(path) => Some(FileLock::exclusive(path).await?),
            None => None,
        };
        debug!("Acquired deployment lock for {}", host);
        Ok(HostGuard {
            host: host.to_string(),
            _file: file,
            _guard: guard,
        })
    }

    /// Whether a deployment in this process currently holds `host`
    pub fn is_busy(&self, host: &str) -> bool {
        self.lock_for(host).try_lock().is_err()
    }
}

fn lock_file_in(dir: &Path, host: &str) -> PathBuf {
    let name: String = host
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    dir.join(format!("{}.lock", name))
}
