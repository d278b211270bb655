//! FSM unit tests

use rollout::deploy::fsm::{DeploymentEvent, DeploymentFsm, DeploymentState};
use rollout::models::deployment::{FinalStatus, StepKind};

#[test]
fn test_fsm_initial_state() {
    let fsm = DeploymentFsm::new();
    assert_eq!(fsm.state(), DeploymentState::Pending);
    assert!(fsm.error().is_none());
    assert!(!fsm.state().is_terminal());
}

#[test]
fn test_fsm_deploy_success_flow() {
    let mut fsm = DeploymentFsm::new();

    // Pending -> Connecting -> Fetching
    fsm.process(DeploymentEvent::Connect).unwrap();
    assert_eq!(fsm.state(), DeploymentState::Connecting);
    fsm.process(DeploymentEvent::Connected).unwrap();
    assert_eq!(fsm.state(), DeploymentState::Fetching);
    assert_eq!(fsm.state().step(), Some(StepKind::Fetch));

    fsm.process(DeploymentEvent::StepSucceeded).unwrap();
    assert_eq!(fsm.state(), DeploymentState::Installing);

    fsm.process(DeploymentEvent::StepSucceeded).unwrap();
    assert_eq!(fsm.state(), DeploymentState::Restarting);

    fsm.process(DeploymentEvent::StepSucceeded).unwrap();
    assert_eq!(fsm.state(), DeploymentState::HealthChecking);

    fsm.process(DeploymentEvent::StepSucceeded).unwrap();
    assert_eq!(fsm.state(), DeploymentState::Succeeded);
    assert_eq!(fsm.state().final_status(), Some(FinalStatus::Success));
}

#[test]
fn test_fsm_connect_failure_flow() {
    let mut fsm = DeploymentFsm::new();

    fsm.process(DeploymentEvent::Connect).unwrap();
    fsm.process(DeploymentEvent::Failed("host key mismatch".to_string()))
        .unwrap();

    assert_eq!(fsm.state(), DeploymentState::Failed);
    assert_eq!(fsm.error(), Some("host key mismatch"));
}

#[test]
fn test_fsm_abort_between_steps() {
    let mut fsm = DeploymentFsm::new();

    fsm.process(DeploymentEvent::Connect).unwrap();
    fsm.process(DeploymentEvent::Connected).unwrap();
    fsm.process(DeploymentEvent::StepSucceeded).unwrap();

    // Installing -> Aborted
    fsm.process(DeploymentEvent::Abort).unwrap();
    assert_eq!(fsm.state(), DeploymentState::Aborted);
    assert_eq!(fsm.state().final_status(), Some(FinalStatus::Aborted));
    assert_eq!(fsm.state().step(), None);
}

#[test]
fn test_fsm_abort_before_connect() {
    let mut fsm = DeploymentFsm::new();
    fsm.process(DeploymentEvent::Abort).unwrap();
    assert_eq!(fsm.state(), DeploymentState::Aborted);
}

#[test]
fn test_fsm_invalid_transition() {
    let mut fsm = DeploymentFsm::new();

    // Cannot succeed a step before connecting
    let result = fsm.process(DeploymentEvent::StepSucceeded);
    assert!(result.is_err());
    assert_eq!(fsm.state(), DeploymentState::Pending);

    // Cannot fail from pending
    assert!(fsm.process(DeploymentEvent::Failed("x".to_string())).is_err());
}

#[test]
fn test_fsm_state_serialization() {
    let json = serde_json::to_string(&DeploymentState::HealthChecking).unwrap();
    assert_eq!(json, "\"health_checking\"");
}
