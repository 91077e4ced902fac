//! ptyssh - interactive SSH sessions with a PTY
//!
//! Built on tokio and russh. See [`ssh::Session`] for the entry point.

pub mod ssh;

pub use ssh::{
    CommandOutput, ConnectionConfig, HostKeyPolicy, LossListener, OutputSink, Session,
    SessionError, SessionState,
};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber
///
/// `RUST_LOG` overrides the default `info` filter. Calling this twice is a
/// no-op.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
