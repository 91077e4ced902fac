//! SSH Configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::error::SessionError;

/// SSH connection configuration
///
/// Immutable once handed to a session, except for the terminal geometry
/// which follows live resizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Password; when absent the server's keyboard-interactive prompts are
    /// routed through the auth prompt bridge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Terminal type requested for the PTY
    #[serde(default = "default_terminal_type")]
    pub terminal_type: String,

    /// Terminal columns
    #[serde(default = "default_cols")]
    pub cols: u32,

    /// Terminal rows
    #[serde(default = "default_rows")]
    pub rows: u32,

    /// Connection + handshake timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// How the server's host key is checked
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,
}

/// Host key checking mode
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Accept any host key without checking
    #[default]
    AcceptAny,

    /// Check against an OpenSSH known_hosts file
    KnownHosts {
        /// File to use (default: ~/.ssh/known_hosts)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<PathBuf>,
        /// - true: reject unknown hosts
        /// - false: accept and record unknown hosts
        ///
        /// Changed keys are rejected either way.
        #[serde(default)]
        strict: bool,
    },
}

fn default_port() -> u16 {
    22
}

fn default_terminal_type() -> String {
    "xterm".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_cols() -> u32 {
    80
}

fn default_rows() -> u32 {
    24
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            username: String::new(),
            password: None,
            terminal_type: default_terminal_type(),
            cols: 80,
            rows: 24,
            timeout_secs: 30,
            host_key_policy: HostKeyPolicy::AcceptAny,
        }
    }
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            ..Default::default()
        }
    }

    /// Create a new config with password authentication
    pub fn with_password(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            password: Some(password.into()),
            ..Self::new(host, port, username)
        }
    }

    pub fn with_terminal(mut self, terminal_type: impl Into<String>) -> Self {
        self.terminal_type = terminal_type.into();
        self
    }

    pub fn with_size(mut self, cols: u32, rows: u32) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }

    pub fn with_host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key_policy = policy;
        self
    }

    /// Parse a config from JSON
    pub fn from_json(json: &str) -> Result<Self, SessionError> {
        serde_json::from_str(json).map_err(|e| SessionError::Config(e.to_string()))
    }

    /// Check the config before connecting
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.username.trim().is_empty() {
            return Err(SessionError::Config("username must not be empty".to_string()));
        }
        if self.host.trim().is_empty() {
            return Err(SessionError::Config("host must not be empty".to_string()));
        }
        Ok(())
    }

    /// `host:port` for socket resolution, with IPv6 hosts bracketed
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn display_name(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }

    /// Password, treating an empty string as absent
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref().filter(|p| !p.is_empty())
    }
}
