//! Trigger receiver, executor and ledger composed per request

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::deploy::executor::RemoteExecutor;
use crate::errors::AgentError;
use crate::ledger::store::Ledger;
use crate::models::deployment::{DeploymentRequest, DeploymentResult, FinalStatus};
use crate::trigger::receiver::{TriggerEvent, TriggerReceiver};

/// Runs accepted requests and records their results.
///
/// The host lock is held across execution and the ledger append, so the next
/// request for a host starts only after the previous result is durable.
pub struct Deployer {
    receiver: TriggerReceiver,
    executor: RemoteExecutor,
    ledger: Arc<Ledger>,
    inflight: Mutex<HashMap<String, CancellationToken>>,
    /// Parent of every per-request token; cancelled on shutdown
    shutdown: CancellationToken,
}

impl Deployer {
    pub fn new(receiver: TriggerReceiver, executor: RemoteExecutor, ledger: Arc<Ledger>) -> Self {
        Self {
            receiver,
            executor,
            ledger,
            inflight: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn receiver(&self) -> &TriggerReceiver {
        &self.receiver
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Validate a trigger event
    pub fn accept(&self, event: TriggerEvent) -> Result<DeploymentRequest, AgentError> {
        self.receiver.accept(event)
    }

    /// Execute a request and durably record its result.
    ///
    /// Returns `LedgerWriteError` when the result could not be recorded; the
    /// result is then never reported. Fails before running anything if the
    /// host lock file cannot be opened.
    pub async fn deploy(&self, request: DeploymentRequest) -> Result<DeploymentResult, AgentError> {
        let cancel = self.register(&request);
        let outcome = self.deploy_with(&request, &cancel).await;
        self.unregister(request.request_id());
        outcome
    }

    /// Like [`Deployer::deploy`], observing an abort signal owned by the caller
    pub async fn deploy_with(
        &self,
        request: &DeploymentRequest,
        cancel: &CancellationToken,
    ) -> Result<DeploymentResult, AgentError> {
        let guard = self.executor.locks().acquire(request.target_host()).await?;
        let result = self.executor.execute_locked(request, cancel).await;

        if let Err(e) = self.ledger.append(&result).await {
            error!(
                "Unable to record result of {} ({}): {}",
                result.request_id, result.final_status, e
            );
            return Err(e);
        }
        drop(guard);

        info!(
            "Recorded deployment {} on {}: {}",
            result.request_id, result.target_host, result.final_status
        );
        Ok(result)
    }

    /// Abort an in-flight deployment; false when it is not running
    pub fn abort(&self, request_id: &str) -> bool {
        let inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        match inflight.get(request_id) {
            Some(token) => {
                warn!("Aborting deployment {}", request_id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Abort everything in flight and every request started from now on
    pub fn abort_all(&self) {
        let inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        if !inflight.is_empty() {
            warn!("Aborting {} in-flight deployment(s)", inflight.len());
        }
        self.shutdown.cancel();
    }

    /// Whether a deployment currently holds `host`
    pub fn is_host_busy(&self, host: &str) -> bool {
        self.executor.locks().is_busy(host)
    }

    pub fn is_inflight(&self, request_id: &str) -> bool {
        let inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        inflight.contains_key(request_id)
    }

    /// A child token is born cancelled once shutdown has begun
    fn register(&self, request: &DeploymentRequest) -> CancellationToken {
        let token = self.shutdown.child_token();
        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        inflight.insert(request.request_id().to_string(), token.clone());
        token
    }

    fn unregister(&self, request_id: &str) {
        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        inflight.remove(request_id);
    }
}

/// Process exit code for a foreground deployment.
///
/// A result that never reached the ledger counts as a failure, whatever the
/// steps said.
pub fn exit_code(outcome: &Result<DeploymentResult, AgentError>) -> u8 {
    let status = match outcome {
        Ok(result) => result.final_status,
        Err(_) => FinalStatus::Failed,
    };
    status.exit_code() as u8
}
