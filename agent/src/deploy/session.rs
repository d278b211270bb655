//! Remote session abstraction

use std::time::Duration;

use async_trait::async_trait;

use crate::errors::AgentError;
use crate::storage::settings::TargetSettings;

/// Output of one remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last non-empty line of stdout, trimmed
    pub fn last_line(&self) -> Option<&str> {
        self.stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
    }

    /// stdout followed by stderr
    pub fn combined(&self) -> String {
        if self.stderr.trim().is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// An authenticated session on one target host.
///
/// Errors from `run` are `ChannelError` when the transport failed and
/// `Timeout` when the command outlived its bound; a command that ran and
/// exited non-zero is a successful `run` with a non-zero exit code.
#[async_trait]
pub trait RemoteSession: Send {
    async fn run(&mut self, command: &str, timeout: Duration) -> Result<CommandOutput, AgentError>;

    /// Release the channel. Must be safe to call more than once.
    async fn close(&mut self);
}

/// Opens remote sessions
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &TargetSettings) -> Result<Box<dyn RemoteSession>, AgentError>;
}

/// Time granted past a command's own bound before the session is given up on
pub const COMMAND_GRACE: Duration = Duration::from_secs(5);

/// Run a command, failing with `Timeout` if the session itself stops answering
pub async fn run_bounded(
    session: &mut dyn RemoteSession,
    command: &str,
    timeout: Duration,
) -> Result<CommandOutput, AgentError> {
    run_with_deadline(session, command, timeout, timeout + COMMAND_GRACE).await
}

/// Run a command that must be over by `limit`, session stalls included
pub async fn run_within(
    session: &mut dyn RemoteSession,
    command: &str,
    limit: Duration,
) -> Result<CommandOutput, AgentError> {
    run_with_deadline(session, command, limit, limit).await
}

async fn run_with_deadline(
    session: &mut dyn RemoteSession,
    command: &str,
    timeout: Duration,
    deadline: Duration,
) -> Result<CommandOutput, AgentError> {
    match tokio::time::timeout(deadline, session.run(command, timeout)).await {
        Ok(result) => result,
        Err(_) => Err(AgentError::Timeout(format!(
            "command did not finish within {:?}",
            timeout
        ))),
    }
}
