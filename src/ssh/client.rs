//! SSH Client implementation using russh

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, AuthResult, Handle, KeyboardInteractiveAuthResponse};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use russh::{MethodKind, MethodSet};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::config::{AuthMethod, SshConfig};
use super::error::SshError;
use super::handle_owner::spawn_handle_owner_task;
use super::keyboard_interactive::{await_answers, Challenge, KbiError, KbiPrompt};
use super::known_hosts::{HostKeyVerification, KnownHostsStore};
use super::session::SshSession;
use super::transport::{Connector, Transport};
use crate::config::AuthConfig;

/// Timeout for waiting on the user to answer a keyboard-interactive round
pub const DEFAULT_KBI_TIMEOUT: Duration = Duration::from_secs(60);

/// Dials SSH servers with russh and authenticates them
pub struct RusshConnector {
    known_hosts: Arc<KnownHostsStore>,
    kbi_timeout: Duration,
}

impl RusshConnector {
    pub fn new(known_hosts: Arc<KnownHostsStore>) -> Self {
        Self {
            known_hosts,
            kbi_timeout: DEFAULT_KBI_TIMEOUT,
        }
    }

    /// Connector using the configured keyboard-interactive timeout
    pub fn from_config(config: &AuthConfig, known_hosts: Arc<KnownHostsStore>) -> Self {
        Self::new(known_hosts).with_kbi_timeout(Duration::from_secs(config.kbi_timeout_secs))
    }

    pub fn with_kbi_timeout(mut self, timeout: Duration) -> Self {
        self.kbi_timeout = timeout;
        self
    }

    /// Run keyboard-interactive rounds until the server decides.
    ///
    /// With a `cached_password`, the first round whose prompts are all
    /// non-echo is answered with it; many bastions ask for the account
    /// password this way instead of through the password method.
    async fn keyboard_interactive(
        &self,
        handle: &mut Handle<ClientHandler>,
        login: &str,
        cached_password: Option<&str>,
        challenges: &mpsc::Sender<Challenge>,
    ) -> Result<AuthResult, SshError> {
        let mut reply = handle
            .authenticate_keyboard_interactive_start(login, None::<String>)
            .await?;
        let mut cached_used = false;

        loop {
            match reply {
                KeyboardInteractiveAuthResponse::Success => return Ok(AuthResult::Success),
                KeyboardInteractiveAuthResponse::Failure {
                    remaining_methods,
                    partial_success,
                } => {
                    return Ok(AuthResult::Failure {
                        remaining_methods,
                        partial_success,
                    })
                }
                KeyboardInteractiveAuthResponse::InfoRequest {
                    name,
                    instructions,
                    prompts,
                } => {
                    debug!("KBI round for {} with {} prompts", login, prompts.len());

                    let answers = match cached_password {
                        Some(password)
                            if !cached_used
                                && !prompts.is_empty()
                                && prompts.iter().all(|p| !p.echo) =>
                        {
                            cached_used = true;
                            prompts.iter().map(|_| password.to_string()).collect()
                        }
                        _ => {
                            let prompts = prompts
                                .iter()
                                .map(|p| KbiPrompt::new(p.prompt.clone(), p.echo))
                                .collect();
                            let (challenge, reply_rx) = Challenge::new(name, instructions, prompts);
                            challenges.send(challenge).await.map_err(|_| {
                                SshError::AuthenticationFailed(
                                    "no handler for keyboard-interactive prompts".to_string(),
                                )
                            })?;
                            await_answers(reply_rx, self.kbi_timeout)
                                .await
                                .map_err(|e| match e {
                                    KbiError::Timeout => SshError::Timeout(
                                        "keyboard-interactive prompt was not answered".to_string(),
                                    ),
                                    other => SshError::AuthenticationFailed(other.to_string()),
                                })?
                        }
                    };

                    reply = handle
                        .authenticate_keyboard_interactive_respond(answers)
                        .await?;
                }
            }
        }
    }
}

#[async_trait]
impl Connector for RusshConnector {
    async fn connect(
        &self,
        config: &SshConfig,
        password: Option<String>,
        challenges: mpsc::Sender<Challenge>,
    ) -> Result<Arc<dyn Transport>, SshError> {
        let (host, port) = config.dial_target();
        let addr = format!("{}:{}", host, port);
        let timeout = Duration::from_secs(config.timeout_secs);

        info!("Connecting to SSH server at {}", addr);

        let socket_addr = tokio::net::lookup_host(&addr)
            .await
            .map_err(|e| SshError::ConnectionFailed(format!("Failed to resolve address: {}", e)))?
            .next()
            .ok_or_else(|| SshError::ConnectionFailed(format!("No address found for {}", addr)))?;

        let stream = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(socket_addr))
            .await
            .map_err(|_| SshError::Timeout(format!("Connection to {} timed out", addr)))?
            .map_err(|e| SshError::ConnectionFailed(e.to_string()))?;

        let ssh_config = Arc::new(client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        });

        let handler = ClientHandler::new(
            host.to_string(),
            port,
            config.strict_host_key_checking,
            self.known_hosts.clone(),
        );

        let mut handle = tokio::time::timeout(
            timeout,
            client::connect_stream(ssh_config, stream, handler),
        )
        .await
        .map_err(|_| SshError::Timeout(format!("SSH handshake with {} timed out", addr)))??;

        debug!("SSH handshake completed");

        let login = config.login_username();
        let result = match &config.auth {
            AuthMethod::Password { .. } => {
                let password = password
                    .or_else(|| config.stored_password().map(str::to_string))
                    .ok_or_else(|| {
                        SshError::AuthenticationFailed("no password supplied".to_string())
                    })?;

                match handle.authenticate_password(&login, &password).await? {
                    AuthResult::Failure {
                        remaining_methods, ..
                    } if supports_method(&remaining_methods, MethodKind::KeyboardInteractive) => {
                        debug!("Password method rejected for {}, trying keyboard-interactive", login);
                        self.keyboard_interactive(&mut handle, &login, Some(&password), &challenges)
                            .await?
                    }
                    other => other,
                }
            }
            AuthMethod::Key {
                key_path,
                passphrase,
            } => {
                let key_path = expand_tilde(Path::new(key_path));
                debug!("Loading key from: {:?}", key_path);
                let key = russh::keys::load_secret_key(&key_path, passphrase.as_deref())
                    .map_err(|e| SshError::KeyError(e.to_string()))?;
                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);

                handle.authenticate_publickey(&login, key_with_hash).await?
            }
            AuthMethod::KeyboardInteractive => {
                self.keyboard_interactive(&mut handle, &login, None, &challenges)
                    .await?
            }
        };

        if !result.success() {
            return Err(SshError::AuthenticationFailed(
                "Authentication rejected by server".to_string(),
            ));
        }

        info!("SSH authentication successful for {}", login);

        let connection_id = uuid::Uuid::new_v4().to_string();
        let controller = spawn_handle_owner_task(handle, connection_id.clone());
        Ok(Arc::new(SshSession::new(connection_id, controller)))
    }
}

fn supports_method(methods: &MethodSet, target: MethodKind) -> bool {
    methods.iter().any(|m| *m == target)
}

/// Expand ~ to home directory
fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if let Some(stripped) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path_str == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }

    path.to_path_buf()
}

/// Client handler for russh callbacks (host key verification)
pub struct ClientHandler {
    /// Target host for key verification
    host: String,
    /// Target port
    port: u16,
    /// Strict host key checking mode
    /// - true: reject unknown/changed keys
    /// - false: trust unknown keys on first use (still reject changed)
    strict: bool,
    known_hosts: Arc<KnownHostsStore>,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, strict: bool, known_hosts: Arc<KnownHostsStore>) -> Self {
        Self {
            host,
            port,
            strict,
            known_hosts,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        match self.known_hosts.verify(&self.host, self.port, server_public_key) {
            HostKeyVerification::Verified => {
                info!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            HostKeyVerification::Unknown { fingerprint } => {
                if self.strict {
                    warn!(
                        "Unknown host key for {}:{} (fingerprint: {}). Strict mode enabled, rejecting.",
                        self.host, self.port, fingerprint
                    );
                    return Err(SshError::HostKeyRejected(format!(
                        "unknown host {}:{} (fingerprint {})",
                        self.host, self.port, fingerprint
                    )));
                }
                info!(
                    "New host {}:{}, trusting on first use (fingerprint: {})",
                    self.host, self.port, fingerprint
                );
                self.known_hosts.trust(&self.host, self.port, &fingerprint);
                Ok(true)
            }
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                // ALWAYS reject changed keys - potential MITM attack
                warn!(
                    "HOST KEY CHANGED for {}:{}! Expected {}, got {}",
                    self.host, self.port, expected_fingerprint, actual_fingerprint
                );
                Err(SshError::HostKeyRejected(format!(
                    "key for {}:{} has changed (expected {}, got {})",
                    self.host, self.port, expected_fingerprint, actual_fingerprint
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand_tilde(Path::new("~/.ssh/id_ed25519")), home.join(".ssh/id_ed25519"));
        assert_eq!(expand_tilde(Path::new("~")), home);
        assert_eq!(expand_tilde(Path::new("/etc/key")), PathBuf::from("/etc/key"));
    }
}
