//! Per-host mutual exclusion and ordering

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rollout::app::state::AppState;
use rollout::ledger::filter::LedgerFilter;
use rollout::models::deployment::FinalStatus;
use rollout::storage::layout::StorageLayout;

use crate::support::{self, ScriptedConnector};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_host_never_holds_two_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let settings = support::settings(&["h1"]);
    let connector = Arc::new(ScriptedConnector::healthy().delay(Duration::from_millis(20)));
    let deployer = support::deployer(&settings, connector.clone(), dir.path()).await;

    let mut handles = Vec::new();
    for _ in 0..3 {
        let deployer = deployer.clone();
        let request = support::manual(&deployer, "h1");
        handles.push(tokio::spawn(async move { deployer.deploy(request).await }));
    }
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.final_status, FinalStatus::Success);
    }

    assert_eq!(connector.max_active("h1"), 1);
    assert_eq!(deployer.ledger().len().await, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_agents_on_one_base_dir_share_host_locks() {
    let dir = tempfile::tempdir().unwrap();
    let layout = StorageLayout::new(dir.path());
    let settings = support::settings(&["h1"]);
    let connector = Arc::new(ScriptedConnector::healthy().delay(Duration::from_millis(20)));

    // A running daemon and a one-shot CLI deployment over the same storage
    let daemon = AppState::init(&settings, &layout, connector.clone()).await.unwrap();
    let cli = AppState::init(&settings, &layout, connector.clone()).await.unwrap();

    let from_daemon = support::manual(&daemon.deployer, "h1");
    let from_cli = support::manual(&cli.deployer, "h1");
    let (a, b) = tokio::join!(
        daemon.deployer.deploy(from_daemon),
        cli.deployer.deploy(from_cli)
    );
    assert_eq!(a.unwrap().final_status, FinalStatus::Success);
    assert_eq!(b.unwrap().final_status, FinalStatus::Success);

    assert_eq!(connector.max_active("h1"), 1);
    assert_eq!(support::ledger_lines(dir.path()), 2);
    assert!(dir.path().join("locks").join("h1.lock").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_second_request_starts_after_first_is_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let ledger_dir = dir.path().to_path_buf();
    let seen: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let observed = seen.clone();
    let connector = Arc::new(
        ScriptedConnector::healthy()
            .delay(Duration::from_millis(20))
            .on_connect(move |_| {
                observed
                    .lock()
                    .unwrap()
                    .push(support::ledger_lines(&ledger_dir));
            }),
    );
    let settings = support::settings(&["h1"]);
    let deployer = support::deployer(&settings, connector.clone(), dir.path()).await;

    let first = support::manual(&deployer, "h1");
    let second = support::manual(&deployer, "h1");
    let (a, b) = tokio::join!(deployer.deploy(first), deployer.deploy(second));
    let (a, b) = (a.unwrap(), b.unwrap());

    // Each session opened only after every earlier result was on disk
    assert_eq!(*seen.lock().unwrap(), vec![0, 1]);

    let recorded = deployer
        .ledger()
        .query_all(LedgerFilter::default().host("h1"))
        .await
        .unwrap();
    assert_eq!(recorded.len(), 2);
    let (earlier, later) = if recorded[0].request_id == a.request_id {
        (&a, &b)
    } else {
        (&b, &a)
    };
    assert_eq!(recorded[0].request_id, earlier.request_id);
    assert!(later.started_at >= earlier.completed_at);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_hosts_run_in_parallel() {
    let dir = tempfile::tempdir().unwrap();
    let settings = support::settings(&["h1", "h2"]);
    let connector = Arc::new(ScriptedConnector::healthy().delay(Duration::from_millis(50)));
    let deployer = support::deployer(&settings, connector.clone(), dir.path()).await;

    let h1 = support::manual(&deployer, "h1");
    let h2 = support::manual(&deployer, "h2");
    let (a, b) = tokio::join!(deployer.deploy(h1), deployer.deploy(h2));
    assert!(a.unwrap().is_success());
    assert!(b.unwrap().is_success());

    assert_eq!(connector.max_active("h1"), 1);
    assert_eq!(connector.max_active("h2"), 1);
    assert_eq!(connector.max_total_active(), 2);
}

#[tokio::test]
async fn test_query_sees_only_recorded_results() {
    let dir = tempfile::tempdir().unwrap();
    let settings = support::settings(&["h1"]);
    let connector = Arc::new(ScriptedConnector::healthy().delay(Duration::from_millis(30)));
    let deployer = support::deployer(&settings, connector.clone(), dir.path()).await;

    let request = support::manual(&deployer, "h1");
    let request_id = request.request_id().to_string();
    let running = {
        let deployer = deployer.clone();
        tokio::spawn(async move { deployer.deploy(request).await })
    };

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(deployer.is_inflight(&request_id));
    assert!(deployer.ledger().get(&request_id).await.unwrap().is_none());

    let result = running.await.unwrap().unwrap();
    assert_eq!(
        deployer.ledger().get(&request_id).await.unwrap(),
        Some(result)
    );
    assert!(!deployer.is_inflight(&request_id));
}
