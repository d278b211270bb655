//! The fixed deployment step sequence and each step's success predicate

use std::time::Duration;

use crate::deploy::session::CommandOutput;
use crate::models::deployment::{DeploymentRequest, ExitStatus, StepKind};
use crate::storage::settings::TargetSettings;
use crate::trigger::receiver::is_commit_id;
use crate::utils::{shell_quote, tail_excerpt};

/// Lines of output kept per step
pub const EXCERPT_MAX_LINES: usize = 40;

/// Bytes of output kept per step
pub const EXCERPT_MAX_BYTES: usize = 4096;

/// What must hold for a step to count as successful
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuccessPredicate {
    /// HEAD equals the requested revision (and the commit id, when one was requested)
    TreeMatchesRef { expected_commit: Option<String> },

    /// The command exited zero
    ZeroExit,

    /// The service manager reports the unit `active`
    UnitActive,

    /// The probe printed a 2xx HTTP status
    HttpOk,
}

impl SuccessPredicate {
    /// Evaluate the predicate against a command's output
    pub fn check(&self, output: &CommandOutput) -> Result<(), String> {
        if !output.success() {
            return Err(format!("exited with status {}", output.exit_code));
        }

        match self {
            SuccessPredicate::ZeroExit => Ok(()),
            SuccessPredicate::TreeMatchesRef { expected_commit } => {
                let revs: Vec<&str> = output
                    .stdout
                    .lines()
                    .map(str::trim)
                    .filter(|l| is_commit_id(l))
                    .collect();
                let [.., head, wanted] = revs.as_slice() else {
                    return Err("could not resolve HEAD and the requested ref".to_string());
                };
                if !head.eq_ignore_ascii_case(wanted) {
                    return Err(format!("HEAD {} does not match {}", head, wanted));
                }
                match expected_commit {
                    Some(commit) if !head.eq_ignore_ascii_case(commit) => {
                        Err(format!("HEAD {} does not match requested commit {}", head, commit))
                    }
                    _ => Ok(()),
                }
            }
            SuccessPredicate::UnitActive => match output.last_line() {
                Some("active") => Ok(()),
                Some(state) => Err(format!("unit is {}", state)),
                None => Err("service manager reported no state".to_string()),
            },
            SuccessPredicate::HttpOk => {
                let status = output
                    .last_line()
                    .and_then(|l| l.parse::<u16>().ok())
                    .ok_or_else(|| "probe returned no HTTP status".to_string())?;
                if (200..300).contains(&status) {
                    Ok(())
                } else {
                    Err(format!("probe returned HTTP {}", status))
                }
            }
        }
    }

    /// Map a command's output to the step's exit status
    pub fn exit_status(&self, output: &CommandOutput) -> (ExitStatus, Option<String>) {
        match self.check(output) {
            Ok(()) => (
                ExitStatus::Succeeded {
                    code: output.exit_code,
                },
                None,
            ),
            Err(reason) => (
                ExitStatus::Failed {
                    code: Some(output.exit_code),
                },
                Some(reason),
            ),
        }
    }
}

/// How one attempt at a step ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub exit_status: ExitStatus,

    /// Raw command output, before trimming to an excerpt
    pub log: String,

    /// Why the step did not succeed
    pub reason: Option<String>,
}

impl StepOutcome {
    /// Judge a command's output with the step's predicate
    pub fn judge(predicate: &SuccessPredicate, output: &CommandOutput) -> Self {
        let (exit_status, reason) = predicate.exit_status(output);
        Self {
            exit_status,
            log: output.combined(),
            reason,
        }
    }

    /// An attempt that produced no usable output
    pub fn without_output(exit_status: ExitStatus, reason: String) -> Self {
        Self {
            exit_status,
            log: String::new(),
            reason: Some(reason),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_status.is_success()
    }

    /// Output and reason, trimmed to the excerpt bounds
    pub fn excerpt(&self) -> String {
        let mut log = self.log.clone();
        if let Some(reason) = &self.reason {
            if !log.is_empty() && !log.ends_with('\n') {
                log.push('\n');
            }
            log.push_str(reason);
        }
        tail_excerpt(&log, EXCERPT_MAX_LINES, EXCERPT_MAX_BYTES)
    }
}

/// One step of the sequence, bound to a request and target
#[derive(Debug, Clone)]
pub struct DeploymentStep {
    pub kind: StepKind,
    pub command: String,
    pub predicate: SuccessPredicate,
}

/// Build the full, ordered step sequence for a request
pub fn plan(request: &DeploymentRequest, target: &TargetSettings) -> Vec<DeploymentStep> {
    StepKind::SEQUENCE
        .iter()
        .map(|kind| build_step(*kind, request, target))
        .collect()
}

/// Build one step for a request
pub fn build_step(kind: StepKind, request: &DeploymentRequest, target: &TargetSettings) -> DeploymentStep {
    let workdir = shell_quote(&target.working_directory);
    let unit = shell_quote(&target.service_name);

    let (command, predicate) = match kind {
        StepKind::Fetch => {
            let source_ref = request.source_ref();
            let (rev, expected_commit) = if is_commit_id(source_ref) {
                (source_ref.to_string(), Some(source_ref.to_string()))
            } else {
                (format!("origin/{}", source_ref), None)
            };
            let rev = shell_quote(&rev);
            let command = format!(
                "cd {workdir} && git fetch --prune origin && git reset --hard {rev} && git rev-parse HEAD {rev}^{{commit}}"
            );
            (command, SuccessPredicate::TreeMatchesRef { expected_commit })
        }
        StepKind::InstallDependencies => (
            format!("cd {} && {}", workdir, target.install_command),
            SuccessPredicate::ZeroExit,
        ),
        StepKind::RestartService => (
            format!("sudo -n systemctl restart {unit} && systemctl is-active {unit}"),
            SuccessPredicate::UnitActive,
        ),
        StepKind::HealthCheck => (
            health_check_command(&target.health_check_url, target.health_timeout()),
            SuccessPredicate::HttpOk,
        ),
    };

    DeploymentStep {
        kind,
        command,
        predicate,
    }
}

/// A single `curl` request that gives up after `max_time`
pub fn health_check_command(url: &str, max_time: Duration) -> String {
    format!(
        "curl -sS -o /dev/null -w '%{{http_code}}\\n' --max-time {:.3} {}",
        max_time.as_secs_f64(),
        shell_quote(url)
    )
}
