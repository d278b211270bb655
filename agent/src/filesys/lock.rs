//! Advisory file locks shared between agent processes

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, info};

use crate::errors::AgentError;

/// An exclusive `flock` on a lock file; released when dropped
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    _file: std::fs::File,
}

impl FileLock {
    /// Block until the exclusive lock on `path` is held, creating the file if needed
    pub async fn exclusive(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let path = path.as_ref().to_path_buf();
        tokio::task::spawn_blocking(move || lock_blocking(path))
            .await
            .map_err(|e| AgentError::Internal(format!("File lock task failed: {}", e)))?
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        debug!("Released file lock {}", self.path.display());
    }
}

fn lock_blocking(path: PathBuf) -> Result<FileLock, AgentError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)?;

    match file.try_lock_exclusive() {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
            info!("{} is held by another process; waiting", path.display());
            file.lock_exclusive()?;
        }
        Err(e) => return Err(e.into()),
    }
    Ok(FileLock { path, _file: file })
}
