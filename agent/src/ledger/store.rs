//! Append-only deployment ledger backed by a JSON-lines file

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::stream::{self, Stream, StreamExt};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, Lines, Take};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::errors::AgentError;
use crate::filesys::file::File;
use crate::filesys::lock::FileLock;
use crate::ledger::filter::LedgerFilter;
use crate::models::deployment::DeploymentResult;

/// Just enough of an entry to index it
#[derive(serde::Deserialize)]
struct EntryId {
    request_id: String,
}

/// Durable record of every deployment attempt.
///
/// `append` returns only after the entry has been fsync'd. Readers see the
/// file up to the last fsync'd byte, never a partially written entry.
/// Appends and crash repair hold an exclusive lock on a sibling `.lock` file,
/// so agent processes sharing a ledger never write over each other.
#[derive(Debug)]
pub struct Ledger {
    file: File,
    durable_len: AtomicU64,
    ids: Mutex<HashSet<String>>,
}

impl Ledger {
    /// Open the ledger, repairing a torn trailing entry left by a crash
    pub async fn open(file: File) -> Result<Self, AgentError> {
        Self::load(file, true).await
    }

    /// Open the ledger for reading while another process may be appending.
    ///
    /// A trailing entry without its newline is ignored rather than truncated.
    pub async fn open_read_only(file: File) -> Result<Self, AgentError> {
        Self::load(file, false).await
    }

    async fn load(file: File, repair: bool) -> Result<Self, AgentError> {
        let _lock = if repair {
            Some(FileLock::exclusive(lock_path(&file)).await?)
        } else {
            None
        };
        let contents = match file.read_bytes().await {
            Ok(bytes) => bytes,
            Err(AgentError::IoError(e)) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e),
        };

        let mut durable_len = contents.len() as u64;
        if contents.last().is_some_and(|b| *b != b'\n') {
            durable_len = contents
                .iter()
                .rposition(|b| *b == b'\n')
                .map(|i| i as u64 + 1)
                .unwrap_or(0);
            if repair {
                warn!(
                    "Ledger {} ends with a torn entry, truncating {} byte(s)",
                    file.path().display(),
                    contents.len() as u64 - durable_len
                );
                file.truncate(durable_len).await?;
            }
        }

        let mut ids = HashSet::new();
        for line in contents[..durable_len as usize].split(|b| *b == b'\n') {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<EntryId>(line) {
                Ok(entry) => {
                    ids.insert(entry.request_id);
                }
                Err(e) => warn!("Skipping unreadable ledger entry: {}", e),
            }
        }

        info!(
            "Opened ledger {} with {} entries",
            file.path().display(),
            ids.len()
        );

        Ok(Self {
            file,
            durable_len: AtomicU64::new(durable_len),
            ids: Mutex::new(ids),
        })
    }

    /// Durably record a result.
    ///
    /// Fails with `LedgerWriteError` if the entry could not be written and
    /// synced, or if a result with the same request id is already recorded.
    pub async fn append(&self, result: &DeploymentResult) -> Result<(), AgentError> {
        let line = serde_json::to_string(result)
            .map_err(|e| AgentError::LedgerWriteError(format!("Unable to encode result: {}", e)))?;

        let mut ids = self.ids.lock().await;
        if ids.contains(&result.request_id) {
            return Err(AgentError::LedgerWriteError(format!(
                "Result for request {} is already recorded",
                result.request_id
            )));
        }

        let _lock = FileLock::exclusive(lock_path(&self.file))
            .await
            .map_err(|e| AgentError::LedgerWriteError(format!("Unable to lock ledger: {}", e)))?;
        // Another process may have appended since our last write
        let previous = self
            .file
            .len()
            .await
            .map_err(|e| AgentError::LedgerWriteError(e.to_string()))?;
        match self.file.append_line(&line).await {
            Ok(len) => {
                ids.insert(result.request_id.clone());
                self.durable_len.store(len, Ordering::Release);
                debug!(
                    "Recorded {} for request {}",
                    result.final_status, result.request_id
                );
                Ok(())
            }
            Err(e) => {
                error!("Ledger append failed for {}: {}", result.request_id, e);
                if let Err(e) = self.file.truncate(previous).await {
                    error!("Unable to roll back partial ledger entry: {}", e);
                }
                Err(AgentError::LedgerWriteError(e.to_string()))
            }
        }
    }

    /// Lazily stream recorded results matching `filter`, oldest first
    pub fn query(
        &self,
        filter: LedgerFilter,
    ) -> impl Stream<Item = Result<DeploymentResult, AgentError>> + Send + 'static {
        let state = QueryState::Unopened {
            path: self.file.path().to_path_buf(),
            durable_len: self.durable_len.load(Ordering::Acquire),
            filter,
        };
        stream::unfold(state, next_entry)
    }

    /// Collect every result matching `filter`
    pub async fn query_all(&self, filter: LedgerFilter) -> Result<Vec<DeploymentResult>, AgentError> {
        let mut results = Vec::new();
        let mut entries = Box::pin(self.query(filter));
        while let Some(entry) = entries.next().await {
            results.push(entry?);
        }
        Ok(results)
    }

    /// Look up the result recorded for `request_id`
    pub async fn get(&self, request_id: &str) -> Result<Option<DeploymentResult>, AgentError> {
        if !self.ids.lock().await.contains(request_id) {
            return Ok(None);
        }
        let mut entries = Box::pin(self.query(LedgerFilter::default()));
        while let Some(entry) = entries.next().await {
            let entry = entry?;
            if entry.request_id == request_id {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Number of recorded results
    pub async fn len(&self) -> usize {
        self.ids.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn lock_path(file: &File) -> PathBuf {
    let mut path = file.path().as_os_str().to_owned();
    path.push(".lock");
    PathBuf::from(path)
}

type EntryLines = Lines<BufReader<Take<fs::File>>>;

enum QueryState {
    Unopened {
        path: PathBuf,
        durable_len: u64,
        filter: LedgerFilter,
    },
    Reading {
        lines: EntryLines,
        filter: LedgerFilter,
        yielded: usize,
    },
    Done,
}

async fn next_entry(
    state: QueryState,
) -> Option<(Result<DeploymentResult, AgentError>, QueryState)> {
    let (mut lines, filter, mut yielded) = match state {
        QueryState::Unopened {
            path,
            durable_len,
            filter,
        } => {
            if durable_len == 0 || filter.limit == Some(0) {
                return None;
            }
            match fs::File::open(&path).await {
                Ok(file) => (BufReader::new(file.take(durable_len)).lines(), filter, 0),
                Err(e) if e.kind() == ErrorKind::NotFound => return None,
                Err(e) => return Some((Err(e.into()), QueryState::Done)),
            }
        }
        QueryState::Reading {
            lines,
            filter,
            yielded,
        } => (lines, filter, yielded),
        QueryState::Done => return None,
    };

    if filter.limit.is_some_and(|limit| yielded >= limit) {
        return None;
    }

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<DeploymentResult>(&line) {
                    Ok(result) if filter.matches(&result) => {
                        yielded += 1;
                        let state = QueryState::Reading {
                            lines,
                            filter,
                            yielded,
                        };
                        return Some((Ok(result), state));
                    }
                    Ok(_) => continue,
                    Err(e) => warn!("Skipping unreadable ledger entry: {}", e),
                }
            }
            Ok(None) => return None,
            Err(e) => return Some((Err(e.into()), QueryState::Done)),
        }
    }
}
