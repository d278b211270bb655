//! Application state management

use std::sync::Arc;

use tracing::info;

use crate::app::pipeline::Deployer;
use crate::deploy::executor::RemoteExecutor;
use crate::deploy::locks::HostLocks;
use crate::deploy::session::Connector;
use crate::errors::AgentError;
use crate::ledger::store::Ledger;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::trigger::receiver::TriggerReceiver;

/// Main application state
pub struct AppState {
    /// Receiver, executor and ledger composed
    pub deployer: Arc<Deployer>,
}

impl AppState {
    /// Initialize application state
    pub async fn init(
        settings: &Settings,
        layout: &StorageLayout,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, AgentError> {
        info!("Initializing application state...");

        layout.setup().await?;
        let ledger = Arc::new(Ledger::open(layout.ledger_file()).await?);

        let receiver = TriggerReceiver::new(settings);
        let locks = HostLocks::with_lock_dir(layout.locks_dir().path());
        let executor = RemoteExecutor::new(settings.targets.clone(), connector, locks)?;
        let deployer = Arc::new(Deployer::new(receiver, executor, ledger));

        Ok(Self { deployer })
    }

    /// Shutdown application state
    pub async fn shutdown(&self) -> Result<(), AgentError> {
        info!("Shutting down application state...");
        self.deployer.abort_all();
        Ok(())
    }
}
