//! Scripted in-memory sessions standing in for SSH

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rollout::app::pipeline::Deployer;
use rollout::deploy::executor::RemoteExecutor;
use rollout::deploy::locks::HostLocks;
use rollout::deploy::session::{CommandOutput, Connector, RemoteSession};
use rollout::errors::AgentError;
use rollout::filesys::file::File;
use rollout::ledger::store::Ledger;
use rollout::models::deployment::{DeploymentRequest, StepKind};
use rollout::storage::settings::{Settings, TargetSettings};
use rollout::trigger::receiver::{TriggerEvent, TriggerReceiver};

pub const HEAD: &str = "9fceb02d0ae598e95dc970b74767f19372d61af8";

pub type Responder =
    Arc<dyn Fn(&str, StepKind, usize) -> Result<CommandOutput, AgentError> + Send + Sync>;

pub type ConnectHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Which step a remote command belongs to
pub fn classify(command: &str) -> StepKind {
    if command.contains("git fetch") {
        StepKind::Fetch
    } else if command.contains("systemctl restart") {
        StepKind::RestartService
    } else if command.contains("curl") {
        StepKind::HealthCheck
    } else {
        StepKind::InstallDependencies
    }
}

pub fn output(exit_code: i32, stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

/// What a healthy host answers for each step
pub fn healthy(step: StepKind) -> CommandOutput {
    match step {
        StepKind::Fetch => output(0, &format!("HEAD is now at 9fceb02 Deploy\n{HEAD}\n{HEAD}\n")),
        StepKind::InstallDependencies => output(0, "Successfully installed requirements\n"),
        StepKind::RestartService => output(0, "active\n"),
        StepKind::HealthCheck => output(0, "200\n"),
    }
}

#[derive(Default)]
struct Shared {
    active: HashMap<String, usize>,
    max_active: HashMap<String, usize>,
    total_active: usize,
    max_total_active: usize,
    calls: Vec<(String, StepKind)>,
    attempts: HashMap<(String, StepKind), usize>,
}

/// Connector whose sessions answer from a script and record what ran
pub struct ScriptedConnector {
    responder: Responder,
    delay: Duration,
    connect_error: Option<fn() -> AgentError>,
    on_connect: Option<ConnectHook>,
    shared: Arc<Mutex<Shared>>,
    closes: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    pub fn healthy() -> Self {
        Self::with_responder(|_, step, _| Ok(healthy(step)))
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&str, StepKind, usize) -> Result<CommandOutput, AgentError> + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(responder),
            delay: Duration::ZERO,
            connect_error: None,
            on_connect: None,
            shared: Arc::new(Mutex::new(Shared::default())),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Every command takes this long
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every connection attempt fails with this error
    pub fn refuse(mut self, error: fn() -> AgentError) -> Self {
        self.connect_error = Some(error);
        self
    }

    pub fn on_connect<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_connect = Some(Arc::new(hook));
        self
    }

    /// Steps run so far, in order, as (host, step)
    pub fn calls(&self) -> Vec<(String, StepKind)> {
        self.shared.lock().unwrap().calls.clone()
    }

    pub fn steps_for(&self, host: &str) -> Vec<StepKind> {
        self.calls()
            .into_iter()
            .filter(|(h, _)| h == host)
            .map(|(_, step)| step)
            .collect()
    }

    /// Most sessions ever open at once on `host`
    pub fn max_active(&self, host: &str) -> usize {
        self.shared
            .lock()
            .unwrap()
            .max_active
            .get(host)
            .copied()
            .unwrap_or(0)
    }

    /// Most sessions ever open at once across all hosts
    pub fn max_total_active(&self) -> usize {
        self.shared.lock().unwrap().max_total_active
    }

    pub fn open_sessions(&self) -> usize {
        self.shared.lock().unwrap().total_active
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, target: &TargetSettings) -> Result<Box<dyn RemoteSession>, AgentError> {
        if let Some(error) = self.connect_error {
            return Err(error());
        }
        if let Some(hook) = &self.on_connect {
            hook(&target.target_host);
        }

        {
            let mut shared = self.shared.lock().unwrap();
            let active = shared.active.entry(target.target_host.clone()).or_insert(0);
            *active += 1;
            let active = *active;
            let max = shared.max_active.entry(target.target_host.clone()).or_insert(0);
            *max = (*max).max(active);
            shared.total_active += 1;
            shared.max_total_active = shared.max_total_active.max(shared.total_active);
        }

        Ok(Box::new(ScriptedSession {
            host: target.target_host.clone(),
            responder: self.responder.clone(),
            delay: self.delay,
            shared: self.shared.clone(),
            closes: self.closes.clone(),
            closed: false,
        }))
    }
}

struct ScriptedSession {
    host: String,
    responder: Responder,
    delay: Duration,
    shared: Arc<Mutex<Shared>>,
    closes: Arc<AtomicUsize>,
    closed: bool,
}

impl ScriptedSession {
    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut shared = self.shared.lock().unwrap();
        if let Some(active) = shared.active.get_mut(&self.host) {
            *active -= 1;
        }
        shared.total_active -= 1;
    }
}

#[async_trait]
impl RemoteSession for ScriptedSession {
    async fn run(&mut self, command: &str, _timeout: Duration) -> Result<CommandOutput, AgentError> {
        let step = classify(command);
        let attempt = {
            let mut shared = self.shared.lock().unwrap();
            shared.calls.push((self.host.clone(), step));
            let attempt = shared
                .attempts
                .entry((self.host.clone(), step))
                .or_insert(0);
            *attempt += 1;
            *attempt
        };
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.responder)(&self.host, step, attempt)
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
        self.release();
    }
}

impl Drop for ScriptedSession {
    fn drop(&mut self) {
        self.release();
    }
}

/// A target that retries immediately and probes once a second
pub fn target(host: &str) -> TargetSettings {
    let mut target = TargetSettings::new(
        host,
        "deploy",
        "echoear",
        "/srv/echoear",
        format!("http://{host}:8000/health"),
    );
    target.retry_base_delay_secs = 0;
    target.health_probe_interval_secs = 1;
    target
}

pub fn settings(hosts: &[&str]) -> Settings {
    Settings {
        authorized_actors: vec!["alice".to_string()],
        targets: hosts.iter().map(|h| target(h)).collect(),
        ..Default::default()
    }
}

pub async fn open_ledger(dir: &Path) -> Arc<Ledger> {
    Arc::new(
        Ledger::open(File::new(dir.join("ledger.jsonl")))
            .await
            .unwrap(),
    )
}

/// Deployer over scripted sessions, recording and locking under `dir`
pub async fn deployer(
    settings: &Settings,
    connector: Arc<ScriptedConnector>,
    dir: &Path,
) -> Arc<Deployer> {
    let locks = HostLocks::with_lock_dir(dir.join("locks"));
    let executor = RemoteExecutor::new(settings.targets.clone(), connector, locks).unwrap();
    let receiver = TriggerReceiver::new(settings);
    Arc::new(Deployer::new(receiver, executor, open_ledger(dir).await))
}

/// A manual request for `main` from an authorized actor
pub fn manual(deployer: &Deployer, host: &str) -> DeploymentRequest {
    deployer
        .accept(TriggerEvent::Manual {
            source_ref: "main".to_string(),
            actor: "alice".to_string(),
            target_host: host.to_string(),
        })
        .unwrap()
}

/// Number of entries durably present in the ledger file
pub fn ledger_lines(dir: &Path) -> usize {
    std::fs::read_to_string(dir.join("ledger.jsonl"))
        .map(|s| s.lines().filter(|l| !l.trim().is_empty()).count())
        .unwrap_or(0)
}
