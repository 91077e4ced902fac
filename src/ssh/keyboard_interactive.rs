//! Keyboard-Interactive Authentication bridge
//!
//! The server's challenge prompts are written to the session's output sink and
//! answered by whoever holds the session, through [`AuthPromptBridge::resolve`].
//!
//! ```text
//! russh auth loop                 AuthPromptBridge                 caller
//!    │── request_response ──────────▶│── prompt text ─────▶ OutputSink
//!    │                               │◀──────────────── resolve(value)
//!    │◀── value / "" on timeout ─────│
//! ```
//!
//! At most one prompt is pending at a time; the slot is a oneshot channel and
//! accepts a single resolution. Once cancelled the bridge stays cancelled:
//! later prompts resolve to the empty string without being shown.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::events::OutputSink;

/// Timeout for waiting on user input
pub const AUTH_INPUT_TIMEOUT: Duration = Duration::from_secs(120);

const TIMEOUT_NOTICE: &[u8] = b"\r\nTimeout waiting for input\r\n";

/// A prompt currently waiting for an answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPrompt {
    pub prompt: String,
    /// true = show input (echo), false = mask input (password-style)
    pub echo: bool,
}

struct PendingPrompt {
    prompt: AuthPrompt,
    sender: oneshot::Sender<String>,
}

pub struct AuthPromptBridge {
    output: Arc<dyn OutputSink>,
    pending: Mutex<Option<PendingPrompt>>,
    timeout: Duration,
    cancelled: CancellationToken,
}

impl AuthPromptBridge {
    pub fn new(output: Arc<dyn OutputSink>) -> Self {
        Self::with_timeout(output, AUTH_INPUT_TIMEOUT)
    }

    pub fn with_timeout(output: Arc<dyn OutputSink>, timeout: Duration) -> Self {
        Self {
            output,
            pending: Mutex::new(None),
            timeout,
            cancelled: CancellationToken::new(),
        }
    }

    /// Write the server's banner name / instructions ahead of its prompts
    pub fn show_banner(&self, name: &str, instructions: &str) {
        for line in [name, instructions] {
            if !line.is_empty() {
                self.output.on_output(format!("{}\r\n", line).as_bytes());
            }
        }
    }

    /// Show `prompt` and wait for [`resolve`](Self::resolve), a cancel, or the timeout
    ///
    /// Resolves to the empty string on timeout or cancel. After
    /// [`cancel`](Self::cancel) nothing is shown and the call returns at once.
    pub async fn request_response(&self, prompt: &str, echo: bool) -> String {
        let (sender, receiver) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            // Checked under the slot lock so a concurrent cancel() cannot miss us
            if self.cancelled.is_cancelled() {
                debug!("Auth prompt skipped, bridge cancelled");
                return String::new();
            }
            if pending.is_some() {
                warn!("Replacing an unanswered auth prompt");
            }
            *pending = Some(PendingPrompt {
                prompt: AuthPrompt {
                    prompt: prompt.to_string(),
                    echo,
                },
                sender,
            });
        }

        self.output.on_output(prompt.as_bytes());

        let response = match tokio::time::timeout(self.timeout, receiver).await {
            Ok(Ok(value)) => {
                if echo {
                    self.output.on_output(value.as_bytes());
                }
                self.output.on_output(b"\r\n");
                value
            }
            Ok(Err(_)) => {
                debug!("Auth prompt cancelled");
                String::new()
            }
            Err(_) => {
                warn!("No response to auth prompt within {:?}", self.timeout);
                self.output.on_output(TIMEOUT_NOTICE);
                String::new()
            }
        };

        // Timed out or cancelled slots must not accept a late answer
        self.pending.lock().take();
        response
    }

    /// Deliver the answer to the pending prompt
    ///
    /// Returns false when nothing is pending or it was already answered.
    pub fn resolve(&self, value: &str) -> bool {
        let Some(pending) = self.pending.lock().take() else {
            return false;
        };
        let value = value.trim_end_matches(['\r', '\n']).to_string();
        pending.sender.send(value).is_ok()
    }

    /// Drop the pending prompt and refuse any later ones
    ///
    /// Returns whether a prompt was pending.
    pub fn cancel(&self) -> bool {
        self.cancelled.cancel();
        self.pending.lock().take().is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.is_cancelled()
    }

    pub fn is_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    pub fn pending_prompt(&self) -> Option<AuthPrompt> {
        self.pending.lock().as_ref().map(|p| p.prompt.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Captured(Mutex<Vec<u8>>);

    impl OutputSink for Captured {
        fn on_output(&self, data: &[u8]) {
            self.0.lock().extend_from_slice(data);
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    async fn wait_pending(bridge: &AuthPromptBridge) {
        while !bridge.is_pending() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_resolve_once() {
        let sink = Arc::new(Captured::default());
        let bridge = Arc::new(AuthPromptBridge::new(sink.clone()));

        let waiter = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.request_response("Password: ", false).await })
        };
        wait_pending(&bridge).await;
        assert_eq!(
            bridge.pending_prompt(),
            Some(AuthPrompt {
                prompt: "Password: ".to_string(),
                echo: false
            })
        );

        assert!(bridge.resolve("hunter2\r\n"));
        assert!(!bridge.resolve("again"));
        assert_eq!(waiter.await.unwrap(), "hunter2");
        assert!(!bridge.is_pending());
        assert!(!bridge.resolve("late"));
    }

    #[tokio::test]
    async fn test_hidden_value_never_echoed() {
        let sink = Arc::new(Captured::default());
        let bridge = Arc::new(AuthPromptBridge::new(sink.clone()));

        let waiter = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.request_response("Password: ", false).await })
        };
        wait_pending(&bridge).await;
        bridge.resolve("s3cret");
        waiter.await.unwrap();

        assert_eq!(sink.text(), "Password: \r\n");
    }

    #[tokio::test]
    async fn test_visible_value_echoed() {
        let sink = Arc::new(Captured::default());
        let bridge = Arc::new(AuthPromptBridge::new(sink.clone()));

        let waiter = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.request_response("Token: ", true).await })
        };
        wait_pending(&bridge).await;
        bridge.resolve("123456");
        assert_eq!(waiter.await.unwrap(), "123456");
        assert_eq!(sink.text(), "Token: 123456\r\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_resolves_empty() {
        let sink = Arc::new(Captured::default());
        let bridge = AuthPromptBridge::new(sink.clone());

        let response = bridge.request_response("Password: ", false).await;
        assert_eq!(response, "");
        assert!(sink.text().ends_with("Timeout waiting for input\r\n"));
        assert!(!bridge.resolve("too late"));
    }

    #[tokio::test]
    async fn test_cancel_unblocks_waiter() {
        let sink = Arc::new(Captured::default());
        let bridge = Arc::new(AuthPromptBridge::new(sink.clone()));

        let waiter = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.request_response("Password: ", false).await })
        };
        wait_pending(&bridge).await;
        assert!(bridge.cancel());
        assert_eq!(waiter.await.unwrap(), "");
        assert!(!bridge.cancel());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_sticky() {
        let sink = Arc::new(Captured::default());
        let bridge = Arc::new(AuthPromptBridge::new(sink.clone()));

        let waiter = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                let first = bridge.request_response("Password: ", false).await;
                let second = bridge.request_response("Verification code: ", true).await;
                (first, second)
            })
        };
        wait_pending(&bridge).await;
        bridge.cancel();

        let started = tokio::time::Instant::now();
        assert_eq!(waiter.await.unwrap(), (String::new(), String::new()));
        assert!(started.elapsed() < AUTH_INPUT_TIMEOUT);
        assert!(bridge.is_cancelled());
        assert!(!bridge.is_pending());
        assert!(!sink.text().contains("Verification code"));
    }

    #[test]
    fn test_banner_lines() {
        let sink = Arc::new(Captured::default());
        let bridge = AuthPromptBridge::new(sink.clone());
        bridge.show_banner("", "Enter your OTP");
        assert_eq!(sink.text(), "Enter your OTP\r\n");
    }
}
