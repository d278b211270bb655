//! Trigger receiver: turns raw trigger events into deployment requests

use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::errors::AgentError;
use crate::models::deployment::{DeploymentRequest, TriggerKind};
use crate::storage::settings::Settings;
use crate::trigger::webhook::{self, PushEvent};

/// A trigger as it arrives, before validation
#[derive(Debug, Clone)]
pub enum TriggerEvent {
    /// CI provider push webhook
    Push {
        payload: PushEvent,
        target_host: Option<String>,
    },

    /// CLI or API invocation
    Manual {
        source_ref: String,
        actor: String,
        target_host: String,
    },

    /// Periodic deployment from configuration
    Schedule {
        name: String,
        source_ref: String,
        target_host: String,
    },
}

/// Validates trigger events against the deployment policy
#[derive(Debug, Clone)]
pub struct TriggerReceiver {
    deployable_refs: Vec<String>,
    allow_commit_refs: bool,
    authorized_actors: Vec<String>,
    target_hosts: Vec<String>,
    webhook_secret: Option<SecretString>,
    api_token: Option<SecretString>,
}

impl TriggerReceiver {
    /// Build the receiver from the agent settings
    pub fn new(settings: &Settings) -> Self {
        Self {
            deployable_refs: settings.deployable_refs.clone(),
            allow_commit_refs: settings.allow_commit_refs,
            authorized_actors: settings.authorized_actors.clone(),
            target_hosts: settings
                .targets
                .iter()
                .map(|t| t.target_host.clone())
                .collect(),
            webhook_secret: settings.webhook_secret.clone(),
            api_token: settings.api_token.clone(),
        }
    }

    /// Validate an event and produce a deployment request
    pub fn accept(&self, event: TriggerEvent) -> Result<DeploymentRequest, AgentError> {
        let request = match event {
            TriggerEvent::Push {
                payload,
                target_host,
            } => self.accept_push(payload, target_host)?,
            TriggerEvent::Manual {
                source_ref,
                actor,
                target_host,
            } => {
                let host = self.resolve_host(Some(target_host))?;
                self.authorize(&actor)?;
                let source_ref = self.deployable_ref(&source_ref)?;
                DeploymentRequest::new(source_ref, host, actor, TriggerKind::Manual)
            }
            TriggerEvent::Schedule {
                name,
                source_ref,
                target_host,
            } => {
                let host = self.resolve_host(Some(target_host))?;
                let source_ref = self.deployable_ref(&source_ref)?;
                DeploymentRequest::new(
                    source_ref,
                    host,
                    format!("schedule:{}", name),
                    TriggerKind::Schedule,
                )
            }
        };

        debug!(
            "Accepted {:?} trigger {} ({} -> {}) from {}",
            request.trigger(),
            request.request_id(),
            request.source_ref(),
            request.target_host(),
            request.triggered_by()
        );
        Ok(request)
    }

    fn accept_push(
        &self,
        payload: PushEvent,
        target_host: Option<String>,
    ) -> Result<DeploymentRequest, AgentError> {
        if payload.deleted {
            return Err(AgentError::InvalidTrigger(format!(
                "Push deleted {}",
                payload.git_ref
            )));
        }
        let branch = payload.branch().ok_or_else(|| {
            AgentError::InvalidTrigger(format!("{} is not a branch", payload.git_ref))
        })?;
        let branch = self.deployable_branch(branch)?;

        let actor = payload
            .actor()
            .ok_or_else(|| AgentError::InvalidTrigger("Push event names no actor".to_string()))?
            .to_string();
        self.authorize(&actor)?;

        let host = self.resolve_host(target_host)?;

        // Pin to the pushed commit so a later push cannot change what gets deployed
        let source_ref = match payload.head_commit() {
            Some(sha) if is_commit_id(sha) => sha.to_ascii_lowercase(),
            Some(sha) => {
                return Err(AgentError::InvalidTrigger(format!(
                    "Malformed commit id: {}",
                    sha
                )))
            }
            None => branch,
        };

        Ok(DeploymentRequest::new(
            source_ref,
            host,
            actor,
            TriggerKind::Webhook,
        ))
    }

    /// Check a push webhook signature when a secret is configured
    pub fn verify_push_signature(
        &self,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<(), AgentError> {
        match &self.webhook_secret {
            Some(secret) => {
                webhook::verify_signature(secret.expose_secret().as_bytes(), body, signature)
            }
            None => Ok(()),
        }
    }

    /// Check an `Authorization` header when an API token is configured
    pub fn verify_api_token(&self, authorization: Option<&str>) -> Result<(), AgentError> {
        let Some(token) = &self.api_token else {
            return Ok(());
        };
        let provided = authorization
            .and_then(|h| h.strip_prefix("Bearer "))
            .ok_or_else(|| AgentError::InvalidTrigger("Missing bearer token".to_string()))?;
        if bool::from(provided.trim().as_bytes().ct_eq(token.expose_secret().as_bytes())) {
            Ok(())
        } else {
            Err(AgentError::InvalidTrigger("Invalid bearer token".to_string()))
        }
    }

    fn authorize(&self, actor: &str) -> Result<(), AgentError> {
        if actor.trim().is_empty() {
            return Err(AgentError::InvalidTrigger("Actor is empty".to_string()));
        }
        if self.authorized_actors.iter().any(|a| a == actor) {
            Ok(())
        } else {
            warn!("Rejected trigger from unauthorized actor {}", actor);
            Err(AgentError::InvalidTrigger(format!(
                "Actor {} is not authorized to deploy",
                actor
            )))
        }
    }

    fn resolve_host(&self, target_host: Option<String>) -> Result<String, AgentError> {
        match target_host.filter(|h| !h.trim().is_empty()) {
            Some(host) if self.target_hosts.contains(&host) => Ok(host),
            Some(host) => Err(AgentError::InvalidTrigger(format!(
                "Unknown target host: {}",
                host
            ))),
            None => match self.target_hosts.as_slice() {
                [only] => Ok(only.clone()),
                _ => Err(AgentError::InvalidTrigger(
                    "Target host is required when several targets are configured".to_string(),
                )),
            },
        }
    }

    fn deployable_ref(&self, source_ref: &str) -> Result<String, AgentError> {
        let source_ref = source_ref.trim();
        if is_commit_id(source_ref) {
            if self.allow_commit_refs {
                return Ok(source_ref.to_ascii_lowercase());
            }
            return Err(AgentError::InvalidTrigger(
                "Commit refs are not allowed".to_string(),
            ));
        }
        let branch = source_ref.strip_prefix("refs/heads/").unwrap_or(source_ref);
        self.deployable_branch(branch)
    }

    fn deployable_branch(&self, branch: &str) -> Result<String, AgentError> {
        validate_ref_syntax(branch)?;
        if self.deployable_refs.iter().any(|r| r == branch) {
            Ok(branch.to_string())
        } else {
            Err(AgentError::InvalidTrigger(format!(
                "Ref {} is not deployable",
                branch
            )))
        }
    }
}

/// A full 40-character hex commit id
pub fn is_commit_id(value: &str) -> bool {
    value.len() == 40 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Refs end up in remote shell commands, so only a conservative charset is allowed
fn validate_ref_syntax(value: &str) -> Result<(), AgentError> {
    let valid = !value.is_empty()
        && !value.starts_with('-')
        && !value.contains("..")
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'/' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(AgentError::InvalidTrigger(format!("Invalid ref: {:?}", value)))
    }
}
