//! SSH Client implementation using russh

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, KeyboardInteractiveAuthResponse};
use russh::keys::PublicKey;
use tracing::{debug, info, warn};

use super::config::{ConnectionConfig, HostKeyPolicy};
use super::error::SessionError;
use super::handle_owner::{spawn_handle_owner_task, HandleController};
use super::keyboard_interactive::{AuthPrompt, AuthPromptBridge};
use super::known_hosts::{HostKeyVerification, KnownHostsStore};

/// Open the TCP connection, run the SSH handshake and authenticate
///
/// On success the russh handle is moved into its owner task and the
/// returned controller is the only way to reach it. Never retries.
pub async fn establish(
    config: &ConnectionConfig,
    auth: &AuthPromptBridge,
    session_id: &str,
) -> Result<HandleController, SessionError> {
    let addr = config.address();
    let connect_timeout = Duration::from_secs(config.timeout_secs);
    info!("Connecting to SSH server at {}", addr);

    let socket_addr = tokio::net::lookup_host(&addr)
        .await
        .map_err(|e| SessionError::Connection(format!("Failed to resolve {}: {}", addr, e)))?
        .next()
        .ok_or_else(|| SessionError::Connection(format!("No address found for {}", addr)))?;

    let stream = tokio::time::timeout(connect_timeout, tokio::net::TcpStream::connect(socket_addr))
        .await
        .map_err(|_| SessionError::Connection("Connection timed out".to_string()))?
        .map_err(|e| SessionError::Connection(e.to_string()))?;

    let ssh_config = Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    });

    let handler = ClientHandler::new(config.host.clone(), config.port, &config.host_key_policy)?;

    let mut handle = tokio::time::timeout(
        connect_timeout,
        client::connect_stream(ssh_config, stream, handler),
    )
    .await
    .map_err(|_| SessionError::Connection("SSH handshake timed out".to_string()))?
    .map_err(classify_handshake_error)?;

    debug!("SSH handshake completed");

    match config.password() {
        Some(password) => {
            let result = handle
                .authenticate_password(&config.username, password)
                .await
                .map_err(|e| SessionError::Authentication(e.to_string()))?;
            if !result.success() {
                return Err(SessionError::Authentication(
                    "Password rejected by server".to_string(),
                ));
            }
        }
        None => run_keyboard_interactive(&mut handle, &config.username, auth).await?,
    }

    info!("SSH authentication successful for {}", config.display_name());
    Ok(spawn_handle_owner_task(handle, session_id.to_string()))
}

/// Host key rejections keep their kind; everything else is a connection failure
fn classify_handshake_error(e: SessionError) -> SessionError {
    match e {
        SessionError::HostVerification(_) => e,
        other => SessionError::Connection(format!("SSH handshake failed: {}", other)),
    }
}

/// One server reply in a keyboard-interactive exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KbiRound {
    Success,
    Failure,
    InfoRequest {
        name: String,
        instructions: String,
        prompts: Vec<AuthPrompt>,
    },
}

/// The server side of keyboard-interactive authentication
#[async_trait]
pub trait KeyboardInteractive: Send {
    async fn start(&mut self, username: &str) -> Result<KbiRound, SessionError>;

    async fn respond(&mut self, answers: Vec<String>) -> Result<KbiRound, SessionError>;
}

#[async_trait]
impl KeyboardInteractive for client::Handle<ClientHandler> {
    async fn start(&mut self, username: &str) -> Result<KbiRound, SessionError> {
        let response = self
            .authenticate_keyboard_interactive_start(username, None::<String>)
            .await
            .map_err(|e| {
                SessionError::Authentication(format!("Keyboard-interactive start failed: {}", e))
            })?;
        Ok(to_round(response))
    }

    async fn respond(&mut self, answers: Vec<String>) -> Result<KbiRound, SessionError> {
        let response = self
            .authenticate_keyboard_interactive_respond(answers)
            .await
            .map_err(|e| SessionError::Authentication(e.to_string()))?;
        Ok(to_round(response))
    }
}

fn to_round(response: KeyboardInteractiveAuthResponse) -> KbiRound {
    match response {
        KeyboardInteractiveAuthResponse::Success => KbiRound::Success,
        KeyboardInteractiveAuthResponse::Failure { .. } => KbiRound::Failure,
        KeyboardInteractiveAuthResponse::InfoRequest {
            name,
            instructions,
            prompts,
        } => KbiRound::InfoRequest {
            name,
            instructions,
            prompts: prompts
                .into_iter()
                .map(|p| AuthPrompt {
                    prompt: p.prompt,
                    echo: p.echo,
                })
                .collect(),
        },
    }
}

/// Answer each keyboard-interactive round through the prompt bridge
///
/// Stops with an authentication error as soon as the bridge is cancelled.
pub async fn run_keyboard_interactive(
    server: &mut dyn KeyboardInteractive,
    username: &str,
    auth: &AuthPromptBridge,
) -> Result<(), SessionError> {
    let mut round = server.start(username).await?;

    loop {
        match round {
            KbiRound::Success => return Ok(()),
            KbiRound::Failure => {
                return Err(SessionError::Authentication(
                    "Authentication rejected by server".to_string(),
                ));
            }
            KbiRound::InfoRequest {
                name,
                instructions,
                prompts,
            } => {
                debug!("Keyboard-interactive round with {} prompts", prompts.len());
                if auth.is_cancelled() {
                    return Err(cancelled());
                }
                auth.show_banner(&name, &instructions);

                let mut answers = Vec::with_capacity(prompts.len());
                for prompt in &prompts {
                    let answer = auth.request_response(&prompt.prompt, prompt.echo).await;
                    if auth.is_cancelled() {
                        return Err(cancelled());
                    }
                    answers.push(answer);
                }

                round = server.respond(answers).await?;
            }
        }
    }
}

fn cancelled() -> SessionError {
    SessionError::Authentication("Authentication cancelled".to_string())
}

/// russh client callbacks: host key verification
pub struct ClientHandler {
    host: String,
    port: u16,
    /// None accepts every key
    known_hosts: Option<KnownHostsStore>,
    strict: bool,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, policy: &HostKeyPolicy) -> Result<Self, SessionError> {
        let (known_hosts, strict) = match policy {
            HostKeyPolicy::AcceptAny => (None, false),
            HostKeyPolicy::KnownHosts { path, strict } => {
                let path = path.clone().unwrap_or_else(KnownHostsStore::default_path);
                let store = KnownHostsStore::open(path)
                    .map_err(|e| SessionError::HostVerification(format!("Cannot read known_hosts: {}", e)))?;
                (Some(store), *strict)
            }
        };
        Ok(Self {
            host,
            port,
            known_hosts,
            strict,
        })
    }
}

impl ClientHandler {
    /// Accept, record or reject a server key according to the policy
    fn check_key(&self, server_public_key: &PublicKey) -> Result<bool, SessionError> {
        let Some(store) = &self.known_hosts else {
            debug!("Host key checking disabled for {}:{}", self.host, self.port);
            return Ok(true);
        };

        match store.verify(&self.host, self.port, server_public_key) {
            HostKeyVerification::Verified => {
                info!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            HostKeyVerification::Unknown { fingerprint } if self.strict => {
                warn!(
                    "Unknown host key for {}:{} ({}), strict mode",
                    self.host, self.port, fingerprint
                );
                Err(SessionError::HostVerification(format!(
                    "unknown host {}:{} (fingerprint {})",
                    self.host, self.port, fingerprint
                )))
            }
            HostKeyVerification::Unknown { fingerprint } => {
                info!(
                    "New host {}:{}, adding to known_hosts ({})",
                    self.host, self.port, fingerprint
                );
                if let Err(e) = store.add_host(&self.host, self.port, server_public_key) {
                    warn!("Failed to save host key: {}", e);
                }
                Ok(true)
            }
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => Err(SessionError::HostVerification(format!(
                "key for {}:{} has changed (expected {}, got {})",
                self.host, self.port, expected_fingerprint, actual_fingerprint
            ))),
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SessionError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        self.check_key(server_public_key)
    }
}
