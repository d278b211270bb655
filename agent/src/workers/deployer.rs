//! Deployment worker: runs queued requests, one task per request

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::app::pipeline::Deployer;
use crate::errors::AgentError;
use crate::models::deployment::DeploymentRequest;

/// Deployer worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Requests that may wait in the queue before submitters are refused
    pub queue_capacity: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self { queue_capacity: 64 }
    }
}

/// Submits accepted requests to the deployer worker
#[derive(Debug, Clone)]
pub struct DeployQueue {
    tx: mpsc::Sender<DeploymentRequest>,
}

impl DeployQueue {
    /// Queue a request without waiting for it to run
    pub fn submit(&self, request: DeploymentRequest) -> Result<(), AgentError> {
        let request_id = request.request_id().to_string();
        self.tx.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                AgentError::ServerError(format!("Deployment queue is full, dropping {}", request_id))
            }
            mpsc::error::TrySendError::Closed(_) => {
                AgentError::ShutdownError(format!("Deployer has stopped, dropping {}", request_id))
            }
        })?;
        debug!("Queued deployment {}", request_id);
        Ok(())
    }
}

/// Create the queue and the receiving end handed to [`run`]
pub fn channel(options: &Options) -> (DeployQueue, mpsc::Receiver<DeploymentRequest>) {
    let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
    (DeployQueue { tx }, rx)
}

/// Run the deployer worker.
///
/// Each request runs in its own task; the per-host lock inside the deployer
/// serializes requests for the same host. On shutdown, in-flight deployments
/// are aborted between steps, requests still queued are recorded as aborted,
/// and the worker returns once every result has been recorded.
pub async fn run(
    deployer: Arc<Deployer>,
    mut rx: mpsc::Receiver<DeploymentRequest>,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) {
    info!("Deployer worker starting...");
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Deployer worker shutting down...");
                break;
            }
            request = rx.recv() => {
                match request {
                    Some(request) => spawn_deployment(&mut tasks, deployer.clone(), request),
                    None => {
                        debug!("Deployment queue closed");
                        break;
                    }
                }
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                log_join(joined);
            }
        }
    }

    deployer.abort_all();
    rx.close();
    while let Some(request) = rx.recv().await {
        spawn_deployment(&mut tasks, deployer.clone(), request);
    }

    if !tasks.is_empty() {
        info!("Waiting for {} deployment(s) to finish...", tasks.len());
    }
    while let Some(joined) = tasks.join_next().await {
        log_join(joined);
    }
    info!("Deployer worker stopped");
}

fn spawn_deployment(
    tasks: &mut JoinSet<Result<(), AgentError>>,
    deployer: Arc<Deployer>,
    request: DeploymentRequest,
) {
    tasks.spawn(async move {
        let request_id = request.request_id().to_string();
        match deployer.deploy(request).await {
            Ok(result) => {
                debug!("Deployment {} finished: {}", request_id, result.final_status);
                Ok(())
            }
            Err(e) => {
                error!("Deployment {} could not be recorded: {}", request_id, e);
                Err(e)
            }
        }
    });
}

fn log_join(joined: Result<Result<(), AgentError>, tokio::task::JoinError>) {
    if let Err(e) = joined {
        warn!("Deployment task ended abnormally: {}", e);
    }
}
