//! Application configuration options

use std::time::Duration;

use crate::storage::settings::{ScheduleSettings, Settings};
use crate::workers::deployer;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Enable the HTTP trigger server
    pub enable_server: bool,

    /// Server configuration
    pub server: ServerOptions,

    /// Deployer worker options
    pub deployer: deployer::Options,

    /// Periodic deployments, one scheduler worker each
    pub schedules: Vec<ScheduleSettings>,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            enable_server: true,
            server: ServerOptions::default(),
            deployer: deployer::Options::default(),
            schedules: Vec::new(),
        }
    }
}

impl AppOptions {
    /// Derive the daemon options from the settings file
    pub fn from_settings(settings: &Settings) -> Self {
        // Shutdown waits for the running step of every deployment to finish
        let longest_step = settings
            .targets
            .iter()
            .map(|t| t.command_timeout().max(t.health_timeout()))
            .max()
            .unwrap_or_default();

        Self {
            lifecycle: LifecycleOptions {
                max_shutdown_delay: LifecycleOptions::default()
                    .max_shutdown_delay
                    .max(longest_step + Duration::from_secs(30)),
            },
            enable_server: settings.enable_server,
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
            deployer: deployer::Options::default(),
            schedules: settings.schedules.clone(),
        }
    }
}

/// Lifecycle options for the agent
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}
