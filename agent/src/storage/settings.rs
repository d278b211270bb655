//! Settings file management

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::errors::AgentError;
use crate::logs::LogLevel;
use crate::utils::CooldownOptions;

/// Agent settings.
///
/// Secret-bearing fields are held as `SecretString`, whose `Debug` output is
/// redacted, so the whole struct can be logged.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON logs on stdout
    #[serde(default)]
    pub log_json: bool,

    /// Directory for rotated log files
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Local HTTP server configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// Enable the HTTP trigger server
    #[serde(default = "default_true")]
    pub enable_server: bool,

    /// Branches that may be deployed
    #[serde(default = "default_deployable_refs")]
    pub deployable_refs: Vec<String>,

    /// Accept full commit ids as refs
    #[serde(default)]
    pub allow_commit_refs: bool,

    /// Actors allowed to trigger deployments
    #[serde(default)]
    pub authorized_actors: Vec<String>,

    /// Shared secret for push webhook signatures
    #[serde(default)]
    pub webhook_secret: Option<SecretString>,

    /// Bearer token for the manual trigger endpoint
    #[serde(default)]
    pub api_token: Option<SecretString>,

    /// Deployment targets
    #[serde(default)]
    pub targets: Vec<TargetSettings>,

    /// Periodic deployments
    #[serde(default)]
    pub schedules: Vec<ScheduleSettings>,
}

fn default_true() -> bool {
    true
}

fn default_deployable_refs() -> Vec<String> {
    vec!["main".to_string()]
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_dir: None,
            server: ServerSettings::default(),
            enable_server: true,
            deployable_refs: default_deployable_refs(),
            allow_commit_refs: false,
            authorized_actors: Vec::new(),
            webhook_secret: None,
            api_token: None,
            targets: Vec::new(),
            schedules: Vec::new(),
        }
    }
}

impl Settings {
    /// Find the target configured for `host`
    pub fn target(&self, host: &str) -> Option<&TargetSettings> {
        self.targets.iter().find(|t| t.target_host == host)
    }

    /// Check the settings for values that would only fail later at deploy time
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.targets.is_empty() {
            return Err(AgentError::ConfigError("No targets configured".to_string()));
        }

        let mut hosts = HashSet::new();
        for target in &self.targets {
            target.validate()?;
            if !hosts.insert(target.target_host.as_str()) {
                return Err(AgentError::ConfigError(format!(
                    "Duplicate target host: {}",
                    target.target_host
                )));
            }
        }

        for schedule in &self.schedules {
            if schedule.name.trim().is_empty() {
                return Err(AgentError::ConfigError("Schedule name is empty".to_string()));
            }
            if schedule.interval_secs == 0 {
                return Err(AgentError::ConfigError(format!(
                    "Schedule {} has a zero interval",
                    schedule.name
                )));
            }
            if self.target(&schedule.target_host).is_none() {
                return Err(AgentError::ConfigError(format!(
                    "Schedule {} references unknown target {}",
                    schedule.name, schedule.target_host
                )));
            }
        }

        Ok(())
    }
}

/// Local HTTP server settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    8080
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

/// Where the health probe runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthProbeMode {
    /// `curl` on the target host over the remote session
    #[default]
    Remote,

    /// HTTP request from the agent itself
    Direct,
}

/// One deployment target host
#[derive(Debug, Clone, Deserialize)]
pub struct TargetSettings {
    pub target_host: String,

    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    pub ssh_user: String,

    /// Private key file used for public-key authentication
    pub private_key_path: PathBuf,

    #[serde(default)]
    pub private_key_passphrase: Option<SecretString>,

    /// OpenSSH known_hosts file the host key must match
    #[serde(default = "default_known_hosts_path")]
    pub known_hosts_path: PathBuf,

    /// systemd unit to restart
    pub service_name: String,

    /// Checkout on the target host
    pub working_directory: String,

    #[serde(default = "default_install_command")]
    pub install_command: String,

    pub health_check_url: String,

    #[serde(default)]
    pub health_probe: HealthProbeMode,

    /// Bound on the health check wait
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    #[serde(default = "default_health_probe_interval")]
    pub health_probe_interval_secs: u64,

    /// Bound on each remote command
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Retries after channel failures, for idempotent steps
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_secs: u64,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_known_hosts_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ssh")
        .join("known_hosts")
}

fn default_install_command() -> String {
    "pip install -r requirements.txt".to_string()
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_health_probe_interval() -> u64 {
    2
}

fn default_command_timeout() -> u64 {
    600
}

fn default_retry_count() -> u32 {
    2
}

fn default_retry_base_delay() -> u64 {
    2
}

impl TargetSettings {
    /// A target with every optional field at its default
    pub fn new(
        target_host: impl Into<String>,
        ssh_user: impl Into<String>,
        service_name: impl Into<String>,
        working_directory: impl Into<String>,
        health_check_url: impl Into<String>,
    ) -> Self {
        Self {
            target_host: target_host.into(),
            ssh_port: default_ssh_port(),
            ssh_user: ssh_user.into(),
            private_key_path: PathBuf::from("id_ed25519"),
            private_key_passphrase: None,
            known_hosts_path: default_known_hosts_path(),
            service_name: service_name.into(),
            working_directory: working_directory.into(),
            install_command: default_install_command(),
            health_check_url: health_check_url.into(),
            health_probe: HealthProbeMode::default(),
            timeout_seconds: default_timeout_seconds(),
            health_probe_interval_secs: default_health_probe_interval(),
            command_timeout_secs: default_command_timeout(),
            retry_count: default_retry_count(),
            retry_base_delay_secs: default_retry_base_delay(),
        }
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn health_probe_interval(&self) -> Duration {
        Duration::from_secs(self.health_probe_interval_secs.max(1))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Backoff used between retries of idempotent steps
    pub fn retry_backoff(&self) -> CooldownOptions {
        CooldownOptions {
            base_delay: Duration::from_secs(self.retry_base_delay_secs),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }

    fn validate(&self) -> Result<(), AgentError> {
        let required = [
            ("target_host", &self.target_host),
            ("ssh_user", &self.ssh_user),
            ("service_name", &self.service_name),
            ("working_directory", &self.working_directory),
            ("health_check_url", &self.health_check_url),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(AgentError::ConfigError(format!(
                    "Target {}: {} is empty",
                    self.target_host, name
                )));
            }
        }

        url::Url::parse(&self.health_check_url).map_err(|e| {
            AgentError::ConfigError(format!(
                "Target {}: invalid health_check_url: {}",
                self.target_host, e
            ))
        })?;

        if self.timeout_seconds == 0 {
            return Err(AgentError::ConfigError(format!(
                "Target {}: timeout_seconds must be positive",
                self.target_host
            )));
        }

        Ok(())
    }
}

/// A periodic deployment
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleSettings {
    pub name: String,

    #[serde(default = "default_schedule_ref")]
    pub source_ref: String,

    pub target_host: String,

    pub interval_secs: u64,
}

fn default_schedule_ref() -> String {
    "main".to_string()
}
