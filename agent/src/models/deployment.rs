//! Deployment models

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a deployment request came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Webhook,
    Manual,
    Schedule,
}

/// A normalized deployment request.
///
/// Built only by the trigger receiver and consumed once by the executor. The
/// fields are private so a request cannot change after it has been accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentRequest {
    request_id: String,
    source_ref: String,
    target_host: String,
    requested_at: DateTime<Utc>,
    triggered_by: String,
    trigger: TriggerKind,
}

impl DeploymentRequest {
    pub(crate) fn new(
        source_ref: String,
        target_host: String,
        triggered_by: String,
        trigger: TriggerKind,
    ) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            source_ref,
            target_host,
            requested_at: Utc::now(),
            triggered_by,
            trigger,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Commit or branch identifier to deploy
    pub fn source_ref(&self) -> &str {
        &self.source_ref
    }

    pub fn target_host(&self) -> &str {
        &self.target_host
    }

    pub fn requested_at(&self) -> DateTime<Utc> {
        self.requested_at
    }

    /// Actor identity that asked for the deployment
    pub fn triggered_by(&self) -> &str {
        &self.triggered_by
    }

    pub fn trigger(&self) -> TriggerKind {
        self.trigger
    }
}

/// The fixed deployment steps, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Fetch,
    InstallDependencies,
    RestartService,
    HealthCheck,
}

impl StepKind {
    /// Every step, in the order it runs
    pub const SEQUENCE: [StepKind; 4] = [
        StepKind::Fetch,
        StepKind::InstallDependencies,
        StepKind::RestartService,
        StepKind::HealthCheck,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Fetch => "fetch",
            StepKind::InstallDependencies => "install_dependencies",
            StepKind::RestartService => "restart_service",
            StepKind::HealthCheck => "health_check",
        }
    }

    /// Whether a channel failure during this step may be retried
    pub fn is_idempotent(&self) -> bool {
        matches!(self, StepKind::Fetch | StepKind::HealthCheck)
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a step ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ExitStatus {
    /// The success predicate held
    Succeeded { code: i32 },

    /// The command ran but the success predicate did not hold
    Failed { code: Option<i32> },

    /// The remote channel failed and retries were exhausted or not allowed
    ChannelError,

    /// The step did not finish within its bound
    TimedOut,
}

impl ExitStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitStatus::Succeeded { .. })
    }
}

/// One executed step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: StepKind,
    pub exit_status: ExitStatus,
    pub duration_ms: u64,
    pub log_excerpt: String,

    /// Attempts made, including retries after channel failures
    #[serde(default = "default_attempts")]
    pub attempts: u32,
}

fn default_attempts() -> u32 {
    1
}

/// Terminal status of a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Success,
    Failed,
    Aborted,
}

impl FinalStatus {
    /// Process exit code for CLI callers
    pub fn exit_code(&self) -> i32 {
        match self {
            FinalStatus::Success => 0,
            FinalStatus::Failed => 1,
            FinalStatus::Aborted => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FinalStatus::Success => "success",
            FinalStatus::Failed => "failed",
            FinalStatus::Aborted => "aborted",
        }
    }
}

impl std::str::FromStr for FinalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "success" => Ok(FinalStatus::Success),
            "failed" => Ok(FinalStatus::Failed),
            "aborted" => Ok(FinalStatus::Aborted),
            _ => Err(format!("Invalid status: {}", s)),
        }
    }
}

impl fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one deployment attempt, as recorded in the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentResult {
    pub request_id: String,
    pub target_host: String,
    pub source_ref: String,
    pub triggered_by: String,
    pub steps: Vec<StepRecord>,
    pub final_status: FinalStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,

    /// Reason for a failed or aborted deployment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeploymentResult {
    /// Derive the final status from the step records.
    ///
    /// Success requires every step in the sequence to have run and succeeded.
    pub fn status_from_steps(steps: &[StepRecord], aborted: bool) -> FinalStatus {
        if steps.iter().any(|s| !s.exit_status.is_success()) {
            return FinalStatus::Failed;
        }
        if aborted {
            return FinalStatus::Aborted;
        }
        let complete = steps.len() == StepKind::SEQUENCE.len()
            && steps
                .iter()
                .zip(StepKind::SEQUENCE.iter())
                .all(|(record, kind)| record.step == *kind);
        if complete {
            FinalStatus::Success
        } else {
            FinalStatus::Failed
        }
    }

    pub fn is_success(&self) -> bool {
        self.final_status == FinalStatus::Success
    }
}
