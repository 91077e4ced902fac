//! Channel and transport seams
//!
//! The session engine talks to the wire only through these traits. The russh
//! implementations live here (`Channel<Msg>`) and in `handle_owner`
//! (`HandleController`).

use async_trait::async_trait;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tracing::debug;

use super::error::SessionError;
use super::handle_owner::PingResult;

/// What a channel produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    ExitStatus(u32),
    Eof,
    Closed,
    /// Flow-control and other housekeeping messages
    Other,
}

/// One SSH session channel (interactive PTY or exec)
#[async_trait]
pub trait RemoteChannel: Send {
    async fn request_pty(&mut self, term: &str, cols: u32, rows: u32) -> Result<(), SessionError>;

    async fn request_shell(&mut self) -> Result<(), SessionError>;

    async fn exec(&mut self, command: &str) -> Result<(), SessionError>;

    async fn data(&mut self, bytes: &[u8]) -> Result<(), SessionError>;

    async fn window_change(&mut self, cols: u32, rows: u32) -> Result<(), SessionError>;

    /// Next event, or None once the channel is gone
    async fn recv(&mut self) -> Option<ChannelEvent>;

    async fn close(&mut self) -> Result<(), SessionError>;
}

/// An authenticated connection able to open channels
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open_channel(&self) -> Result<Box<dyn RemoteChannel>, SessionError>;

    async fn ping(&self) -> PingResult;

    async fn disconnect(&self);

    fn is_alive(&self) -> bool;
}

#[async_trait]
impl RemoteChannel for Channel<Msg> {
    async fn request_pty(&mut self, term: &str, cols: u32, rows: u32) -> Result<(), SessionError> {
        Channel::request_pty(self, false, term, cols, rows, 0, 0, &[])
            .await
            .map_err(|e| SessionError::Channel(format!("PTY request failed: {}", e)))
    }

    async fn request_shell(&mut self) -> Result<(), SessionError> {
        Channel::request_shell(self, false)
            .await
            .map_err(|e| SessionError::Channel(format!("Shell request failed: {}", e)))
    }

    async fn exec(&mut self, command: &str) -> Result<(), SessionError> {
        Channel::exec(self, true, command)
            .await
            .map_err(|e| SessionError::Channel(format!("Exec request failed: {}", e)))
    }

    async fn data(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        Channel::data(self, bytes)
            .await
            .map_err(|e| SessionError::Channel(format!("Write failed: {}", e)))
    }

    async fn window_change(&mut self, cols: u32, rows: u32) -> Result<(), SessionError> {
        Channel::window_change(self, cols, rows, 0, 0)
            .await
            .map_err(|e| SessionError::Channel(format!("Window change failed: {}", e)))
    }

    async fn recv(&mut self) -> Option<ChannelEvent> {
        let msg = self.wait().await?;
        Some(match msg {
            ChannelMsg::Data { data } => ChannelEvent::Stdout(data.to_vec()),
            // ext 1 is stderr
            ChannelMsg::ExtendedData { data, ext: 1 } => ChannelEvent::Stderr(data.to_vec()),
            ChannelMsg::ExitStatus { exit_status } => ChannelEvent::ExitStatus(exit_status),
            ChannelMsg::Eof => ChannelEvent::Eof,
            ChannelMsg::Close => ChannelEvent::Closed,
            ChannelMsg::ExitSignal { signal_name, .. } => {
                debug!("Channel exit signal {:?}", signal_name);
                ChannelEvent::Other
            }
            _ => ChannelEvent::Other,
        })
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        let _ = self.eof().await;
        Channel::close(self)
            .await
            .map_err(|e| SessionError::Channel(e.to_string()))
    }
}
