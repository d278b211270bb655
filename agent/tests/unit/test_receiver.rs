//! Trigger validation tests

use rollout::errors::AgentError;
use rollout::models::deployment::TriggerKind;
use rollout::trigger::receiver::{TriggerEvent, TriggerReceiver};
use rollout::trigger::webhook::{self, PushEvent};
use tokio_test::{assert_err, assert_ok};

use crate::support::{self, HEAD};

fn push_body(git_ref: &str, after: &str, login: &str) -> String {
    format!(
        r#"{{"ref":"{git_ref}","after":"{after}","deleted":false,"pusher":{{"name":"{login}"}},"sender":{{"login":"{login}"}}}}"#
    )
}

fn push(body: &str, host: Option<&str>) -> TriggerEvent {
    TriggerEvent::Push {
        payload: PushEvent::from_slice(body.as_bytes()).unwrap(),
        target_host: host.map(str::to_string),
    }
}

fn assert_invalid(result: Result<impl std::fmt::Debug, AgentError>) {
    match result {
        Err(AgentError::InvalidTrigger(_)) => {}
        other => panic!("expected InvalidTrigger, got {:?}", other),
    }
}

#[test]
fn test_push_is_pinned_to_pushed_commit() {
    let receiver = TriggerReceiver::new(&support::settings(&["h1"]));
    let body = push_body("refs/heads/main", &HEAD.to_uppercase(), "alice");

    let request = assert_ok!(receiver.accept(push(&body, None)));

    assert_eq!(request.source_ref(), HEAD);
    assert_eq!(request.target_host(), "h1");
    assert_eq!(request.triggered_by(), "alice");
    assert_eq!(request.trigger(), TriggerKind::Webhook);
    assert!(!request.request_id().is_empty());
}

#[test]
fn test_request_ids_are_unique() {
    let receiver = TriggerReceiver::new(&support::settings(&["h1"]));
    let body = push_body("refs/heads/main", HEAD, "alice");

    let first = receiver.accept(push(&body, None)).unwrap();
    let second = receiver.accept(push(&body, None)).unwrap();
    assert_ne!(first.request_id(), second.request_id());
}

#[test]
fn test_push_rejections() {
    let receiver = TriggerReceiver::new(&support::settings(&["h1", "h2"]));

    // Deleted branch
    let deleted = format!(
        r#"{{"ref":"refs/heads/main","after":"{}","deleted":true,"sender":{{"login":"alice"}}}}"#,
        "0".repeat(40)
    );
    assert_invalid(receiver.accept(push(&deleted, Some("h1"))));

    // Tags are not deployable
    let tag = push_body("refs/tags/v1.0", HEAD, "alice");
    assert_invalid(receiver.accept(push(&tag, Some("h1"))));

    // Branch outside the deployable set
    let feature = push_body("refs/heads/feature/x", HEAD, "alice");
    assert_invalid(receiver.accept(push(&feature, Some("h1"))));

    // Unauthorized pusher
    let mallory = push_body("refs/heads/main", HEAD, "mallory");
    assert_invalid(receiver.accept(push(&mallory, Some("h1"))));

    // Several targets and none named
    let body = push_body("refs/heads/main", HEAD, "alice");
    assert_invalid(receiver.accept(push(&body, None)));

    // Malformed commit id
    let short = push_body("refs/heads/main", "9fceb02", "alice");
    assert_invalid(receiver.accept(push(&short, Some("h1"))));
}

#[test]
fn test_malformed_payload_is_rejected() {
    assert_invalid(PushEvent::from_slice(b"{not json"));
    assert_invalid(PushEvent::from_slice(br#"{"after": "abc"}"#));
}

#[test]
fn test_manual_trigger() {
    let receiver = TriggerReceiver::new(&support::settings(&["h1", "h2"]));

    let request = assert_ok!(receiver.accept(TriggerEvent::Manual {
        source_ref: "refs/heads/main".to_string(),
        actor: "alice".to_string(),
        target_host: "h2".to_string(),
    }));
    assert_eq!(request.source_ref(), "main");
    assert_eq!(request.target_host(), "h2");
    assert_eq!(request.trigger(), TriggerKind::Manual);

    // Unknown host
    assert_invalid(receiver.accept(TriggerEvent::Manual {
        source_ref: "main".to_string(),
        actor: "alice".to_string(),
        target_host: "h9".to_string(),
    }));

    // Shell metacharacters never reach a remote command
    assert_invalid(receiver.accept(TriggerEvent::Manual {
        source_ref: "main;reboot".to_string(),
        actor: "alice".to_string(),
        target_host: "h1".to_string(),
    }));

    // Commit refs are off unless enabled
    assert_invalid(receiver.accept(TriggerEvent::Manual {
        source_ref: HEAD.to_string(),
        actor: "alice".to_string(),
        target_host: "h1".to_string(),
    }));
}

#[test]
fn test_manual_commit_ref_when_allowed() {
    let mut settings = support::settings(&["h1"]);
    settings.allow_commit_refs = true;
    let receiver = TriggerReceiver::new(&settings);

    let request = assert_ok!(receiver.accept(TriggerEvent::Manual {
        source_ref: HEAD.to_string(),
        actor: "alice".to_string(),
        target_host: "h1".to_string(),
    }));
    assert_eq!(request.source_ref(), HEAD);
}

#[test]
fn test_no_authorized_actors_rejects_people_not_schedules() {
    let mut settings = support::settings(&["h1"]);
    settings.authorized_actors.clear();
    let receiver = TriggerReceiver::new(&settings);

    assert_invalid(receiver.accept(TriggerEvent::Manual {
        source_ref: "main".to_string(),
        actor: "alice".to_string(),
        target_host: "h1".to_string(),
    }));

    let request = assert_ok!(receiver.accept(TriggerEvent::Schedule {
        name: "nightly".to_string(),
        source_ref: "main".to_string(),
        target_host: "h1".to_string(),
    }));
    assert_eq!(request.triggered_by(), "schedule:nightly");
    assert_eq!(request.trigger(), TriggerKind::Schedule);
}

#[test]
fn test_push_signature() {
    let mut settings = support::settings(&["h1"]);
    settings.webhook_secret = Some("s3cret".to_string().into());
    let receiver = TriggerReceiver::new(&settings);
    let body = push_body("refs/heads/main", HEAD, "alice");
    let signature = webhook::sign(b"s3cret", body.as_bytes());

    assert_ok!(receiver.verify_push_signature(body.as_bytes(), Some(&signature)));
    assert_err!(receiver.verify_push_signature(body.as_bytes(), None));
    assert_err!(receiver.verify_push_signature(b"tampered", Some(&signature)));
    let forged = webhook::sign(b"other", body.as_bytes());
    assert_err!(receiver.verify_push_signature(body.as_bytes(), Some(&forged)));
}

#[test]
fn test_api_token() {
    let mut settings = support::settings(&["h1"]);
    settings.api_token = Some("t0k3n".to_string().into());
    let receiver = TriggerReceiver::new(&settings);

    assert_ok!(receiver.verify_api_token(Some("Bearer t0k3n")));
    assert_err!(receiver.verify_api_token(Some("Bearer nope")));
    assert_err!(receiver.verify_api_token(Some("t0k3n")));
    assert_err!(receiver.verify_api_token(None));

    // Without a token configured the endpoint is open
    let open = TriggerReceiver::new(&support::settings(&["h1"]));
    assert_ok!(open.verify_api_token(None));
}
