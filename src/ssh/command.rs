//! One-shot command execution on its own channel
//!
//! Runs beside the interactive PTY on the same connection. A deadline only
//! ever closes the command's channel.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use super::channel::{ChannelEvent, RemoteChannel, Transport};
use super::error::SessionError;

/// Collected result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_status: Option<u32>,
}

impl CommandOutput {
    /// stdout followed by stderr, lossily decoded
    pub fn combined(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&self.stderr));
        text
    }
}

/// A command in flight, bounded by its deadline
#[derive(Debug, Clone)]
struct PendingCommand {
    command: String,
    /// None when the timeout is too large to represent, i.e. unbounded
    deadline: Option<Instant>,
    timeout: Duration,
}

impl PendingCommand {
    /// Run `fut` until the deadline; None means it timed out
    async fn within<F: Future>(&self, fut: F) -> Option<F::Output> {
        match self.deadline {
            Some(deadline) => timeout_at(deadline, fut).await.ok(),
            None => Some(fut.await),
        }
    }

    fn timed_out(&self) -> SessionError {
        warn!("Command timed out after {:?}: {}", self.timeout, self.command);
        SessionError::CommandTimeout(self.timeout.as_secs_f64())
    }
}

pub struct CommandChannel {
    transport: Arc<dyn Transport>,
}

impl CommandChannel {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Run `command` and return stdout + stderr as text
    pub async fn run(&self, command: &str, timeout: Duration) -> Result<String, SessionError> {
        Ok(self.run_detailed(command, timeout).await?.combined())
    }

    /// Run `command`, raising `CommandTimeout` if it has not finished by `timeout`
    pub async fn run_detailed(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, SessionError> {
        let pending = PendingCommand {
            command: command.to_string(),
            deadline: Instant::now().checked_add(timeout),
            timeout,
        };
        debug!("Executing command with {:?} timeout: {}", timeout, command);

        let mut channel = pending
            .within(self.transport.open_channel())
            .await
            .ok_or_else(|| pending.timed_out())??;

        let outcome = pending.within(collect_output(channel.as_mut(), command)).await;
        match outcome {
            Some(result) => {
                if let Ok(output) = &result {
                    info!(
                        "Command finished (exit status {:?}, {} bytes)",
                        output.exit_status,
                        output.stdout.len() + output.stderr.len()
                    );
                }
                result
            }
            None => {
                if let Err(e) = channel.close().await {
                    debug!("Closing timed-out command channel: {}", e);
                }
                Err(pending.timed_out())
            }
        }
    }
}

async fn collect_output(
    channel: &mut dyn RemoteChannel,
    command: &str,
) -> Result<CommandOutput, SessionError> {
    channel.exec(command).await?;

    let mut output = CommandOutput::default();
    while let Some(event) = channel.recv().await {
        match event {
            ChannelEvent::Stdout(data) => output.stdout.extend_from_slice(&data),
            ChannelEvent::Stderr(data) => output.stderr.extend_from_slice(&data),
            ChannelEvent::ExitStatus(status) => output.exit_status = Some(status),
            // exit-status may still follow EOF
            ChannelEvent::Eof | ChannelEvent::Other => {}
            ChannelEvent::Closed => break,
        }
    }
    Ok(output)
}
