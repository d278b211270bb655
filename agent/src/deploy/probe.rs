//! Bounded health probing after a restart

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::deploy::session::{run_within, RemoteSession};
use crate::deploy::steps::{health_check_command, DeploymentStep, StepOutcome};
use crate::errors::AgentError;
use crate::models::deployment::ExitStatus;
use crate::storage::settings::{HealthProbeMode, TargetSettings};

/// Polls a target's health endpoint until it answers 2xx or the bound elapses
#[derive(Debug, Clone)]
pub struct HealthProber {
    http_client: reqwest::Client,
}

impl HealthProber {
    pub fn new() -> Result<Self, AgentError> {
        let http_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { http_client })
    }

    /// Probe until healthy, waiting at most the target's health timeout.
    ///
    /// A channel error from a remote probe is returned as `Err` so the caller
    /// can retry the whole step; every other failure is retried here until the
    /// deadline and then reported as `TimedOut`.
    pub async fn probe_until_healthy(
        &self,
        step: &DeploymentStep,
        target: &TargetSettings,
        session: &mut dyn RemoteSession,
    ) -> Result<StepOutcome, AgentError> {
        let bound = target.health_timeout();
        let deadline = Instant::now() + bound;
        let mut last: Option<StepOutcome> = None;
        let mut probes = 0u32;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let (log, reason) = match last {
                    Some(outcome) => (
                        outcome.log,
                        format!(
                            "no healthy response within {:?} after {} probe(s): {}",
                            bound,
                            probes,
                            outcome.reason.unwrap_or_default()
                        ),
                    ),
                    None => (String::new(), format!("no healthy response within {:?}", bound)),
                };
                return Ok(StepOutcome {
                    exit_status: ExitStatus::TimedOut,
                    log,
                    reason: Some(reason),
                });
            }

            probes += 1;
            let outcome = match target.health_probe {
                HealthProbeMode::Remote => {
                    self.probe_remote(step, target, session, remaining).await?
                }
                HealthProbeMode::Direct => self.probe_direct(&target.health_check_url, remaining).await,
            };

            if outcome.is_success() {
                debug!("{} healthy after {} probe(s)", target.target_host, probes);
                return Ok(outcome);
            }
            debug!(
                "{} not healthy yet: {}",
                target.target_host,
                outcome.reason.as_deref().unwrap_or("unknown")
            );
            last = Some(outcome);

            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(target.health_probe_interval().min(remaining)).await;
        }
    }

    /// One remote request, over by the deadline even if the session stalls
    async fn probe_remote(
        &self,
        step: &DeploymentStep,
        target: &TargetSettings,
        session: &mut dyn RemoteSession,
        remaining: Duration,
    ) -> Result<StepOutcome, AgentError> {
        let command = health_check_command(&target.health_check_url, remaining);
        match run_within(session, &command, remaining).await {
            Ok(output) => Ok(StepOutcome::judge(&step.predicate, &output)),
            Err(AgentError::Timeout(message)) => {
                Ok(StepOutcome::without_output(ExitStatus::TimedOut, message))
            }
            Err(e) => Err(e),
        }
    }

    async fn probe_direct(&self, url: &str, remaining: Duration) -> StepOutcome {
        match self.http_client.get(url).timeout(remaining).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                if response.status().is_success() {
                    StepOutcome {
                        exit_status: ExitStatus::Succeeded { code: 0 },
                        log: format!("HTTP {}", status),
                        reason: None,
                    }
                } else {
                    StepOutcome {
                        exit_status: ExitStatus::Failed { code: None },
                        log: format!("HTTP {}", status),
                        reason: Some(format!("probe returned HTTP {}", status)),
                    }
                }
            }
            Err(e) => StepOutcome::without_output(
                ExitStatus::Failed { code: None },
                format!("probe failed: {}", e),
            ),
        }
    }
}
