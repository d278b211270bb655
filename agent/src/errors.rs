//! Error types for the deployment agent

use thiserror::Error;

/// Main error type for the deployment agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Malformed or unauthorized trigger, rejected before execution
    #[error("Invalid trigger: {0}")]
    InvalidTrigger(String),

    /// Transient connectivity failure on the remote channel
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// A step's success predicate was not met
    #[error("Step failure: {0}")]
    StepFailure(String),

    /// Another deployment holds the host lock
    #[error("Lock contention: {0}")]
    LockContention(String),

    /// The result could not be durably recorded
    #[error("Ledger write error: {0}")]
    LedgerWriteError(String),

    /// A remote command outlived its bound
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Host key or credential rejected by the remote host
    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Whether the error is a transient channel failure worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, AgentError::ChannelError(_))
    }

    /// A dropped channel or a stalled session; idempotent work may be retried
    pub fn is_channel_failure(&self) -> bool {
        matches!(self, AgentError::ChannelError(_) | AgentError::Timeout(_))
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        AgentError::Internal(err.to_string())
    }
}
