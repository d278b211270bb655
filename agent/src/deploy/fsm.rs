//! Finite state machine for one deployment run

use serde::{Deserialize, Serialize};

use crate::models::deployment::{FinalStatus, StepKind};

/// Deployment state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    /// Accepted, nothing started
    Pending,

    /// Opening the remote session
    Connecting,

    Fetching,

    Installing,

    Restarting,

    HealthChecking,

    /// Every step succeeded
    Succeeded,

    /// A step or the connection failed
    Failed,

    /// Cancelled between steps
    Aborted,
}

impl DeploymentState {
    /// The step that runs in this state, if any
    pub fn step(&self) -> Option<StepKind> {
        match self {
            DeploymentState::Fetching => Some(StepKind::Fetch),
            DeploymentState::Installing => Some(StepKind::InstallDependencies),
            DeploymentState::Restarting => Some(StepKind::RestartService),
            DeploymentState::HealthChecking => Some(StepKind::HealthCheck),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.final_status().is_some()
    }

    pub fn final_status(&self) -> Option<FinalStatus> {
        match self {
            DeploymentState::Succeeded => Some(FinalStatus::Success),
            DeploymentState::Failed => Some(FinalStatus::Failed),
            DeploymentState::Aborted => Some(FinalStatus::Aborted),
            _ => None,
        }
    }
}

/// Deployment event
#[derive(Debug, Clone)]
pub enum DeploymentEvent {
    /// Start opening the session
    Connect,

    /// Session is up
    Connected,

    /// The current step's predicate held
    StepSucceeded,

    /// The connection or the current step failed
    Failed(String),

    /// Operator abort, observed between steps
    Abort,
}

/// Deployment FSM
#[derive(Debug, Clone)]
pub struct DeploymentFsm {
    state: DeploymentState,
    error: Option<String>,
}

impl DeploymentFsm {
    /// Create a new FSM in pending state
    pub fn new() -> Self {
        Self {
            state: DeploymentState::Pending,
            error: None,
        }
    }

    /// Get current state
    pub fn state(&self) -> DeploymentState {
        self.state
    }

    /// Get error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: DeploymentEvent) -> Result<(), String> {
        use DeploymentState::*;

        let new_state = match (self.state, &event) {
            (Pending, DeploymentEvent::Connect) => Connecting,
            (Connecting, DeploymentEvent::Connected) => Fetching,

            (Fetching, DeploymentEvent::StepSucceeded) => Installing,
            (Installing, DeploymentEvent::StepSucceeded) => Restarting,
            (Restarting, DeploymentEvent::StepSucceeded) => HealthChecking,
            (HealthChecking, DeploymentEvent::StepSucceeded) => Succeeded,

            (Connecting | Fetching | Installing | Restarting | HealthChecking, DeploymentEvent::Failed(err)) => {
                self.error = Some(err.clone());
                Failed
            }

            (state, DeploymentEvent::Abort) if !state.is_terminal() => Aborted,

            // Invalid transitions
            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(())
    }
}

impl Default for DeploymentFsm {
    fn default() -> Self {
        Self::new()
    }
}
