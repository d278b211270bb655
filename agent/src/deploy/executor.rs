//! Remote executor: runs the step sequence for one request over one session

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::deploy::fsm::{DeploymentEvent, DeploymentFsm};
use crate::deploy::locks::HostLocks;
use crate::deploy::probe::HealthProber;
use crate::deploy::session::{run_bounded, Connector, RemoteSession};
use crate::deploy::steps::{self, DeploymentStep, StepOutcome};
use crate::errors::AgentError;
use crate::models::deployment::{
    DeploymentRequest, DeploymentResult, ExitStatus, StepKind, StepRecord,
};
use crate::storage::settings::TargetSettings;
use crate::utils::calc_exp_backoff;

/// Remote executor
pub struct RemoteExecutor {
    targets: HashMap<String, TargetSettings>,
    connector: Arc<dyn Connector>,
    prober: HealthProber,
    locks: HostLocks,
}

impl RemoteExecutor {
    /// Create an executor for the given targets, serialized by `locks`
    pub fn new(
        targets: Vec<TargetSettings>,
        connector: Arc<dyn Connector>,
        locks: HostLocks,
    ) -> Result<Self, AgentError> {
        Ok(Self {
            targets: targets
                .into_iter()
                .map(|t| (t.target_host.clone(), t))
                .collect(),
            connector,
            prober: HealthProber::new()?,
            locks,
        })
    }

    /// Per-host locks guarding execution
    pub fn locks(&self) -> &HostLocks {
        &self.locks
    }

    /// Run a request under its host lock; fails only if the lock cannot be taken
    pub async fn execute(
        &self,
        request: DeploymentRequest,
        cancel: &CancellationToken,
    ) -> Result<DeploymentResult, AgentError> {
        let _guard = self.locks.acquire(request.target_host()).await?;
        Ok(self.execute_locked(&request, cancel).await)
    }

    /// Run a request; the caller must already hold the host lock
    pub async fn execute_locked(
        &self,
        request: &DeploymentRequest,
        cancel: &CancellationToken,
    ) -> DeploymentResult {
        let started_at = Utc::now();
        info!(
            "Deploying {} to {} (request {}, by {}, queued {}ms)",
            request.source_ref(),
            request.target_host(),
            request.request_id(),
            request.triggered_by(),
            (started_at - request.requested_at()).num_milliseconds().max(0)
        );

        let Some(target) = self.targets.get(request.target_host()) else {
            let message = format!("No target configured for {}", request.target_host());
            error!("{}", message);
            return finish(request, started_at, Vec::new(), false, Some(message));
        };

        let mut fsm = DeploymentFsm::new();
        if cancel.is_cancelled() {
            advance(&mut fsm, DeploymentEvent::Abort);
            warn!("Deployment {} aborted before start", request.request_id());
            return finish(
                request,
                started_at,
                Vec::new(),
                true,
                Some("Aborted before start".to_string()),
            );
        }
        advance(&mut fsm, DeploymentEvent::Connect);

        let mut session = match self.connect(target).await {
            Ok(session) => session,
            Err(e) => {
                error!("Unable to open session to {}: {}", target.target_host, e);
                advance(&mut fsm, DeploymentEvent::Failed(e.to_string()));
                return finish(request, started_at, Vec::new(), false, Some(e.to_string()));
            }
        };
        advance(&mut fsm, DeploymentEvent::Connected);

        let plan = steps::plan(request, target);
        let mut records: Vec<StepRecord> = Vec::with_capacity(plan.len());
        let mut aborted = false;

        while let Some(kind) = fsm.state().step() {
            if cancel.is_cancelled() {
                warn!("Deployment {} aborted before {}", request.request_id(), kind);
                aborted = true;
                advance(&mut fsm, DeploymentEvent::Abort);
                break;
            }

            let Some(step) = plan.iter().find(|s| s.kind == kind) else {
                advance(&mut fsm, DeploymentEvent::Failed(format!("No plan for step {}", kind)));
                break;
            };

            info!("[{}] {} on {}", request.request_id(), kind, target.target_host);
            let record = self.run_step(step, target, session.as_mut()).await;
            let event = if record.exit_status.is_success() {
                DeploymentEvent::StepSucceeded
            } else {
                let message = AgentError::StepFailure(format!(
                    "{} ended with {:?}",
                    kind, record.exit_status
                ))
                .to_string();
                error!("[{}] {}", request.request_id(), message);
                DeploymentEvent::Failed(message)
            };
            records.push(record);

            if !advance(&mut fsm, event) {
                break;
            }
        }

        session.close().await;

        let error = if aborted {
            Some(format!("Aborted after {} step(s)", records.len()))
        } else {
            fsm.error().map(str::to_string)
        };
        let result = finish(request, started_at, records, aborted, error);
        if fsm.state().final_status() != Some(result.final_status) {
            warn!(
                "State machine ended in {:?} but the steps say {}",
                fsm.state(),
                result.final_status
            );
        }
        info!(
            "Deployment {} to {} finished: {}",
            result.request_id, result.target_host, result.final_status
        );
        result
    }

    /// Open the session, retrying transient failures with backoff
    async fn connect(&self, target: &TargetSettings) -> Result<Box<dyn RemoteSession>, AgentError> {
        let backoff = target.retry_backoff();
        let mut retries = 0;
        loop {
            match self.connector.connect(target).await {
                Ok(session) => return Ok(session),
                Err(e) if e.is_channel_failure() && retries < target.retry_count => {
                    let delay = calc_exp_backoff(&backoff, retries);
                    warn!(
                        "Connecting to {} failed ({}), retrying in {:?}",
                        target.target_host, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run one step to completion.
    ///
    /// Channel failures, stalls included, are retried only for idempotent steps,
    /// up to the target's retry count. A step that ran and failed its predicate
    /// is never retried.
    async fn run_step(
        &self,
        step: &DeploymentStep,
        target: &TargetSettings,
        session: &mut dyn RemoteSession,
    ) -> StepRecord {
        let started = Instant::now();
        let backoff = target.retry_backoff();
        let mut attempts = 0;

        let outcome = loop {
            attempts += 1;
            match self.attempt(step, target, session).await {
                Ok(outcome) => break outcome,
                Err(e)
                    if e.is_channel_failure()
                        && step.kind.is_idempotent()
                        && attempts <= target.retry_count =>
                {
                    let delay = calc_exp_backoff(&backoff, attempts - 1);
                    warn!(
                        "{} on {} hit a channel error ({}), retrying in {:?}",
                        step.kind, target.target_host, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(AgentError::Timeout(message)) => {
                    break StepOutcome::without_output(ExitStatus::TimedOut, message)
                }
                Err(e) if e.is_transient() => {
                    break StepOutcome::without_output(ExitStatus::ChannelError, e.to_string())
                }
                Err(e) => {
                    break StepOutcome::without_output(ExitStatus::Failed { code: None }, e.to_string())
                }
            }
        };

        StepRecord {
            step: step.kind,
            exit_status: outcome.exit_status,
            duration_ms: started.elapsed().as_millis() as u64,
            log_excerpt: outcome.excerpt(),
            attempts,
        }
    }

    async fn attempt(
        &self,
        step: &DeploymentStep,
        target: &TargetSettings,
        session: &mut dyn RemoteSession,
    ) -> Result<StepOutcome, AgentError> {
        if step.kind == StepKind::HealthCheck {
            return self.prober.probe_until_healthy(step, target, session).await;
        }
        let output = run_bounded(session, &step.command, target.command_timeout()).await?;
        Ok(StepOutcome::judge(&step.predicate, &output))
    }
}

/// Apply an event, logging rather than panicking on an invalid transition
fn advance(fsm: &mut DeploymentFsm, event: DeploymentEvent) -> bool {
    match fsm.process(event) {
        Ok(()) => true,
        Err(e) => {
            error!("{}", e);
            false
        }
    }
}

fn finish(
    request: &DeploymentRequest,
    started_at: DateTime<Utc>,
    steps: Vec<StepRecord>,
    aborted: bool,
    error: Option<String>,
) -> DeploymentResult {
    let final_status = DeploymentResult::status_from_steps(&steps, aborted);
    DeploymentResult {
        request_id: request.request_id().to_string(),
        target_host: request.target_host().to_string(),
        source_ref: request.source_ref().to_string(),
        triggered_by: request.triggered_by().to_string(),
        steps,
        final_status,
        started_at,
        completed_at: Utc::now(),
        error,
    }
}
