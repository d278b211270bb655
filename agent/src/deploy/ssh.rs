//! SSH sessions on top of libssh2

use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use secrecy::ExposeSecret;
use sha2::{Digest, Sha256};
use ssh2::{CheckResult, ErrorCode, KnownHostFileKind, Session};
use tracing::{debug, info, warn};

use crate::deploy::session::{CommandOutput, Connector, RemoteSession};
use crate::errors::AgentError;
use crate::storage::settings::TargetSettings;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;

/// Opens SSH sessions with public-key auth and strict host key checking
#[derive(Debug, Default, Clone)]
pub struct SshConnector;

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, target: &TargetSettings) -> Result<Box<dyn RemoteSession>, AgentError> {
        let session = SshSession::open(target.clone()).await?;
        Ok(Box::new(session))
    }
}

/// One SSH session, reused across commands.
///
/// After a transport failure the session is dropped and re-established on the
/// next command, so callers can retry without reconnecting themselves.
pub struct SshSession {
    target: TargetSettings,
    session: Option<Arc<Mutex<Session>>>,
}

impl SshSession {
    async fn open(target: TargetSettings) -> Result<Self, AgentError> {
        let session = handshake(&target).await?;
        Ok(Self {
            target,
            session: Some(session),
        })
    }

    async fn session(&mut self) -> Result<Arc<Mutex<Session>>, AgentError> {
        if let Some(session) = &self.session {
            return Ok(session.clone());
        }
        info!("Re-establishing SSH session to {}", self.target.target_host);
        let session = handshake(&self.target).await?;
        self.session = Some(session.clone());
        Ok(session)
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn run(&mut self, command: &str, timeout: Duration) -> Result<CommandOutput, AgentError> {
        let session = self.session().await?;
        let command = command.to_string();

        let result = tokio::task::spawn_blocking(move || {
            let session = session.lock().unwrap_or_else(|e| e.into_inner());
            run_command(&session, &command, timeout)
        })
        .await
        .map_err(|e| AgentError::Internal(format!("SSH worker panicked: {}", e)))?;

        if result.is_err() {
            // The channel state is unknown after a failure; start over next time
            self.session = None;
        }
        result
    }

    async fn close(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let host = self.target.target_host.clone();
        let closed = tokio::task::spawn_blocking(move || {
            let session = session.lock().unwrap_or_else(|e| e.into_inner());
            session.disconnect(None, "deployment finished", None)
        })
        .await;
        match closed {
            Ok(Ok(())) => debug!("Closed SSH session to {}", host),
            Ok(Err(e)) => debug!("SSH disconnect from {} failed: {}", host, e),
            Err(e) => warn!("SSH disconnect task for {} failed: {}", host, e),
        }
    }
}

async fn handshake(target: &TargetSettings) -> Result<Arc<Mutex<Session>>, AgentError> {
    let target = target.clone();
    let session = tokio::task::spawn_blocking(move || connect_blocking(&target))
        .await
        .map_err(|e| AgentError::Internal(format!("SSH connect task failed: {}", e)))??;
    Ok(Arc::new(Mutex::new(session)))
}

fn connect_blocking(target: &TargetSettings) -> Result<Session, AgentError> {
    let host = target.target_host.as_str();
    let addr = (host, target.ssh_port)
        .to_socket_addrs()
        .map_err(|e| AgentError::ChannelError(format!("Failed to resolve {}: {}", host, e)))?
        .next()
        .ok_or_else(|| AgentError::ChannelError(format!("No address for {}", host)))?;

    let tcp = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
        .map_err(|e| AgentError::ChannelError(format!("TCP connect to {} failed: {}", addr, e)))?;
    tcp.set_read_timeout(Some(CONNECT_TIMEOUT)).ok();
    tcp.set_write_timeout(Some(CONNECT_TIMEOUT)).ok();

    let mut session = Session::new()
        .map_err(|e| AgentError::Internal(format!("Failed to create SSH session: {}", e)))?;
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|e| AgentError::ChannelError(format!("SSH handshake with {} failed: {}", host, e)))?;

    verify_host_key(&session, target)?;

    let passphrase = target
        .private_key_passphrase
        .as_ref()
        .map(|p| p.expose_secret().to_string());
    session
        .userauth_pubkey_file(
            &target.ssh_user,
            None,
            &target.private_key_path,
            passphrase.as_deref(),
        )
        .map_err(|e| AgentError::AuthError(format!("SSH key authentication failed: {}", e)))?;
    if !session.authenticated() {
        return Err(AgentError::AuthError(format!(
            "SSH authentication as {} failed",
            target.ssh_user
        )));
    }

    info!("SSH session established to {} as {}", host, target.ssh_user);
    Ok(session)
}

fn verify_host_key(session: &Session, target: &TargetSettings) -> Result<(), AgentError> {
    let host = target.target_host.as_str();
    let (key, _) = session
        .host_key()
        .ok_or_else(|| AgentError::AuthError("SSH host key unavailable".to_string()))?;
    let fingerprint = fingerprint_sha256(key);

    let mut known_hosts = session
        .known_hosts()
        .map_err(|e| AgentError::AuthError(format!("known_hosts unavailable: {}", e)))?;
    if target.known_hosts_path.exists() {
        known_hosts
            .read_file(&target.known_hosts_path, KnownHostFileKind::OpenSSH)
            .map_err(|e| {
                AgentError::AuthError(format!(
                    "Failed to read {}: {}",
                    target.known_hosts_path.display(),
                    e
                ))
            })?;
    }

    match known_hosts.check_port(host, target.ssh_port, key) {
        CheckResult::Match => {
            debug!("Host key for {} verified ({})", host, fingerprint);
            Ok(())
        }
        CheckResult::NotFound => Err(AgentError::AuthError(format!(
            "Host key for {} ({}) is not in {}",
            host,
            fingerprint,
            target.known_hosts_path.display()
        ))),
        CheckResult::Mismatch => Err(AgentError::AuthError(format!(
            "Host key mismatch for {}:{} (got {}); refusing to connect",
            host, target.ssh_port, fingerprint
        ))),
        CheckResult::Failure => Err(AgentError::AuthError(format!(
            "Unable to verify host key for {}",
            host
        ))),
    }
}

fn run_command(session: &Session, command: &str, timeout: Duration) -> Result<CommandOutput, AgentError> {
    session.set_timeout(timeout.as_millis().min(u128::from(u32::MAX)) as u32);

    let mut channel = session.channel_session().map_err(ssh_error)?;
    channel.exec(command).map_err(ssh_error)?;

    let mut stdout = String::new();
    channel.read_to_string(&mut stdout).map_err(io_error)?;
    let mut stderr = String::new();
    channel.stderr().read_to_string(&mut stderr).map_err(io_error)?;

    channel.wait_close().map_err(ssh_error)?;
    let exit_code = channel.exit_status().map_err(ssh_error)?;

    Ok(CommandOutput {
        exit_code,
        stdout,
        stderr,
    })
}

fn ssh_error(e: ssh2::Error) -> AgentError {
    if e.code() == ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) {
        AgentError::Timeout(e.to_string())
    } else {
        AgentError::ChannelError(e.to_string())
    }
}

fn io_error(e: std::io::Error) -> AgentError {
    if e.kind() == std::io::ErrorKind::TimedOut {
        AgentError::Timeout(e.to_string())
    } else {
        AgentError::ChannelError(e.to_string())
    }
}

/// OpenSSH-style `SHA256:<base64>` fingerprint of a host key
pub fn fingerprint_sha256(key: &[u8]) -> String {
    let digest = Sha256::digest(key);
    format!("SHA256:{}", STANDARD_NO_PAD.encode(digest))
}
