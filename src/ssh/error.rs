//! SSH session error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Host key verification failed: {0}")]
    HostVerification(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Command timed out after {0:.1}s")]
    CommandTimeout(f64),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    Protocol(String),
}

impl From<russh::Error> for SessionError {
    fn from(err: russh::Error) -> Self {
        SessionError::Protocol(err.to_string())
    }
}

impl SessionError {
    /// Whether this error came from the command deadline rather than a broken channel
    pub fn is_timeout(&self) -> bool {
        matches!(self, SessionError::CommandTimeout(_))
    }
}

// Serialized as its display string for callers that forward errors as JSON
impl serde::Serialize for SessionError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Why a single read from the interactive channel did not yield data
///
/// The read loop matches on this exhaustively to decide between
/// "keep polling", "expected closure" and "lost".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    /// Poll interval elapsed without data
    Timeout,
    /// Remote side sent EOF / close, or the shell exited
    ChannelClosed,
    /// Underlying connection went away
    ConnectionLost,
    /// Anything else
    Other(String),
}

impl std::fmt::Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadError::Timeout => write!(f, "read timeout"),
            ReadError::ChannelClosed => write!(f, "channel closed"),
            ReadError::ConnectionLost => write!(f, "connection lost"),
            ReadError::Other(e) => write!(f, "read error: {}", e),
        }
    }
}

impl std::error::Error for ReadError {}
