//! Handle Owner Task
//!
//! Only one task owns the russh `Handle<ClientHandler>`. The interactive
//! session and the command side channel both reach it through a cloneable
//! `HandleController`, which sends commands over an mpsc channel. This keeps
//! the handle out of any `Arc<Mutex<_>>` and lets channels be opened while the
//! read loop is busy.

use std::time::Duration;

use async_trait::async_trait;
use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::channel::{RemoteChannel, Transport};
use super::client::ClientHandler;
use super::error::SessionError;

const KEEPALIVE_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Ping result, separating slow links from dead ones
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    Ok,
    /// No reply in time (may be latency, retryable)
    Timeout,
    /// Connection is gone
    IoError,
}

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a session channel (PTY shell or exec)
    ChannelOpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Keepalive probe
    Ping {
        reply_tx: oneshot::Sender<PingResult>,
    },

    /// Disconnect the SSH connection
    Disconnect {
        done_tx: Option<oneshot::Sender<()>>,
    },
}

/// Controller for sending commands to the Handle Owner Task
///
/// Cloning is cheap (copies the sender). Any holder can open channels or
/// disconnect, so it is only handed to code inside the session engine.
#[derive(Clone, Debug)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
}

impl HandleController {
    /// Wrap an existing sender (tests drive the receiving end themselves)
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        Self { cmd_tx }
    }

    /// Open a session channel
    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenSession { reply_tx })
            .await
            .map_err(|_| SessionError::NotConnected)?;
        reply_rx
            .await
            .map_err(|_| SessionError::NotConnected)?
            .map_err(|e| SessionError::Channel(e.to_string()))
    }

    /// Ping the connection
    pub async fn ping(&self) -> PingResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(HandleCommand::Ping { reply_tx }).await.is_err() {
            return PingResult::IoError;
        }
        reply_rx.await.unwrap_or(PingResult::IoError)
    }

    /// Disconnect and wait until the handle has been released
    pub async fn disconnect(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(HandleCommand::Disconnect {
                done_tx: Some(done_tx),
            })
            .await
            .is_ok()
        {
            let _ = done_rx.await;
        }
    }

    /// Whether the Handle Owner Task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

#[async_trait]
impl Transport for HandleController {
    async fn open_channel(&self) -> Result<Box<dyn RemoteChannel>, SessionError> {
        let channel = self.open_session_channel().await?;
        Ok(Box::new(channel))
    }

    async fn ping(&self) -> PingResult {
        HandleController::ping(self).await
    }

    async fn disconnect(&self) {
        HandleController::disconnect(self).await
    }

    fn is_alive(&self) -> bool {
        self.is_connected()
    }
}

/// Spawn the Handle Owner Task
///
/// Consumes the Handle and returns a controller for sending commands.
pub fn spawn_handle_owner_task(
    handle: Handle<ClientHandler>,
    session_id: String,
) -> HandleController {
    let (cmd_tx, cmd_rx) = mpsc::channel::<HandleCommand>(64);
    tokio::spawn(run_handle_owner(handle, session_id, cmd_rx));
    HandleController { cmd_tx }
}

async fn run_handle_owner(
    handle: Handle<ClientHandler>,
    session_id: String,
    mut cmd_rx: mpsc::Receiver<HandleCommand>,
) {
    info!("Handle owner task started for session {}", session_id);
    let mut done_tx = None;

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx } => {
                let result = handle.channel_open_session().await;
                if reply_tx.send(result).is_err() {
                    // Channel is dropped here and the server closes it
                    warn!("Caller dropped before receiving channel_open_session result");
                }
            }

            HandleCommand::Ping { reply_tx } => {
                debug!("Keepalive probe for session {}", session_id);
                let result =
                    match tokio::time::timeout(KEEPALIVE_PROBE_TIMEOUT, handle.send_keepalive(true))
                        .await
                    {
                        Ok(Ok(())) => PingResult::Ok,
                        Ok(Err(russh::Error::Disconnect)) => {
                            warn!("Keepalive: session {} disconnected", session_id);
                            PingResult::IoError
                        }
                        Ok(Err(e)) => {
                            warn!("Keepalive error for session {}: {}", session_id, e);
                            PingResult::Timeout
                        }
                        Err(_) => {
                            warn!("Keepalive timeout for session {}", session_id);
                            PingResult::Timeout
                        }
                    };
                let _ = reply_tx.send(result);
            }

            HandleCommand::Disconnect { done_tx: tx } => {
                info!("Disconnect requested for session {}", session_id);
                done_tx = tx;
                break;
            }
        }
    }

    drain_pending_commands(&mut cmd_rx);

    let _ = handle
        .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
        .await;
    info!("Handle owner task terminated for session {}", session_id);

    if let Some(tx) = done_tx {
        let _ = tx.send(());
    }
}

/// Close the queue and fail every command still in it
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Ping { reply_tx } => {
                let _ = reply_tx.send(PingResult::IoError);
            }
            HandleCommand::Disconnect { done_tx } => {
                if let Some(tx) = done_tx {
                    let _ = tx.send(());
                }
            }
        }
    }
}
