//! Session lifecycle state machine
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──ok──▶ Connected ──disconnect()──▶ Disconnecting ──▶ Disconnected
//!                                 │                  │
//!                                 └──error───────────┴──remote closure / I/O failure──▶ Disconnected
//! ```
//!
//! A session instance makes this trip once. Reconnecting means building a
//! new session from the retained config.

use serde::Serialize;
use tracing::debug;

use super::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug)]
pub struct SessionStateMachine {
    state: SessionState,
    /// Set once the instance has left its initial Disconnected state
    spent: bool,
    error: Option<String>,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            spent: false,
            error: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Last failure, if the session ended on one
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn begin_connect(&mut self) -> Result<(), SessionError> {
        if self.spent || self.state != SessionState::Disconnected {
            return Err(SessionError::InvalidState(
                "session instances cannot be reused; create a new session to reconnect"
                    .to_string(),
            ));
        }
        self.spent = true;
        self.set(SessionState::Connecting);
        Ok(())
    }

    pub fn connect_succeeded(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Connecting {
            return Err(SessionError::InvalidState(format!(
                "cannot complete connect from {:?}",
                self.state
            )));
        }
        self.set(SessionState::Connected);
        Ok(())
    }

    pub fn connect_failed(&mut self, error: &SessionError) {
        self.error = Some(error.to_string());
        self.set(SessionState::Disconnected);
    }

    /// Start a local disconnect; false when there is nothing to tear down
    pub fn begin_disconnect(&mut self) -> bool {
        match self.state {
            SessionState::Connected | SessionState::Connecting => {
                self.set(SessionState::Disconnecting);
                true
            }
            SessionState::Disconnected | SessionState::Disconnecting => false,
        }
    }

    /// Interactive channel ended; returns whether the session was live until now
    pub fn channel_ended(&mut self, reason: Option<String>) -> bool {
        let was_connected = self.state == SessionState::Connected;
        if reason.is_some() {
            self.error = reason;
        }
        self.set(SessionState::Disconnected);
        was_connected
    }

    pub fn finish_disconnect(&mut self) {
        self.set(SessionState::Disconnected);
    }

    fn set(&mut self, next: SessionState) {
        if self.state != next {
            debug!("Session state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}
