//! Server state

use std::sync::Arc;

use crate::app::pipeline::Deployer;
use crate::workers::deployer::DeployQueue;

/// Server state shared across handlers
pub struct ServerState {
    pub deployer: Arc<Deployer>,
    pub queue: DeployQueue,
}

impl ServerState {
    pub fn new(deployer: Arc<Deployer>, queue: DeployQueue) -> Self {
        Self { deployer, queue }
    }
}
