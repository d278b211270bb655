//! Ledger query filters

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::models::deployment::{DeploymentResult, FinalStatus};

/// Selects ledger entries by host, completion time and status.
///
/// The time range applies to `completed_at`: `since` is inclusive, `until`
/// exclusive. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct LedgerFilter {
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub since: Option<DateTime<Utc>>,

    #[serde(default)]
    pub until: Option<DateTime<Utc>>,

    #[serde(default)]
    pub status: Option<FinalStatus>,

    /// Maximum number of entries to yield
    #[serde(default)]
    pub limit: Option<usize>,
}

impl LedgerFilter {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn status(mut self, status: FinalStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `result` passes every set criterion (the limit is not considered)
    pub fn matches(&self, result: &DeploymentResult) -> bool {
        if let Some(host) = &self.host {
            if &result.target_host != host {
                return false;
            }
        }
        if let Some(status) = self.status {
            if result.final_status != status {
                return false;
            }
        }
        if let Some(since) = self.since {
            if result.completed_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if result.completed_at >= until {
                return false;
            }
        }
        true
    }
}
