//! SSH module - interactive PTY sessions over russh
//!
//! # Features
//! - Password and keyboard-interactive (2FA) authentication
//! - PTY shell with automatic answers to terminal capability queries
//! - One-shot commands on side channels of the same connection
//! - Host key verification via ~/.ssh/known_hosts
//! - Unexpected-loss notification for reconnect logic

mod channel;
mod client;
mod command;
mod config;
mod error;
mod events;
mod handle_owner;
pub mod keyboard_interactive;
pub mod known_hosts;
pub mod query_responder;
mod session;
mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{ChannelEvent, RemoteChannel, Transport};
pub use client::{establish, run_keyboard_interactive, ClientHandler, KbiRound, KeyboardInteractive};
pub use command::{CommandChannel, CommandOutput};
pub use config::{ConnectionConfig, HostKeyPolicy};
pub use error::{ReadError, SessionError};
pub use events::{IgnoreLoss, LossFn, LossListener, OutputSink};
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController, PingResult};
pub use keyboard_interactive::{AuthPrompt, AuthPromptBridge, AUTH_INPUT_TIMEOUT};
pub use known_hosts::{HostKeyVerification, KnownHostsStore};
pub use query_responder::{QueryKind, TerminalQueryResponder, NEGOTIATION_WINDOW};
pub use session::{Session, READ_POLL_INTERVAL};
pub use state::SessionState;
