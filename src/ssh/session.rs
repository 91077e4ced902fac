//! Interactive SSH session with PTY
//!
//! A `Session` owns one connection and its interactive PTY channel. After
//! `connect()` a single background task owns the channel: it forwards inbound
//! bytes to the output sink, answers terminal capability queries during the
//! negotiation window, and applies input / resize commands sent from the
//! caller's side. Remote closure or I/O failure ends the task and, unless the
//! caller asked for it via `disconnect()`, fires the loss listener once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::channel::{ChannelEvent, RemoteChannel, Transport};
use super::client;
use super::command::CommandChannel;
use super::config::ConnectionConfig;
use super::error::{ReadError, SessionError};
use super::events::{LossListener, OutputSink};
use super::handle_owner::PingResult;
use super::keyboard_interactive::{AuthPrompt, AuthPromptBridge};
use super::query_responder::{TerminalQueryResponder, NEGOTIATION_WINDOW};
use super::state::{SessionState, SessionStateMachine};

/// How long one read waits before the loop checks back in
pub const READ_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Commands applied to the PTY channel by the read task
#[derive(Debug)]
enum PtyCommand {
    Data(Vec<u8>),
    Resize(u32, u32),
}

/// Why the read loop stopped
enum LoopExit {
    Cancelled,
    Ended(ReadError),
}

/// Everything that exists only while the PTY is up
struct Link {
    transport: Arc<dyn Transport>,
    cmd_tx: mpsc::Sender<PtyCommand>,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
}

pub struct Session {
    id: String,
    config: RwLock<ConnectionConfig>,
    output: Arc<dyn OutputSink>,
    loss: Arc<dyn LossListener>,
    auth: Arc<AuthPromptBridge>,
    state: Arc<Mutex<SessionStateMachine>>,
    manual_disconnect: Arc<AtomicBool>,
    link: Mutex<Option<Link>>,
    negotiation_window: Duration,
    connected_since: Mutex<Option<DateTime<Utc>>>,
}

impl Session {
    pub fn new(
        config: ConnectionConfig,
        output: Arc<dyn OutputSink>,
        loss: Arc<dyn LossListener>,
    ) -> Self {
        let auth = Arc::new(AuthPromptBridge::new(output.clone()));
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            config: RwLock::new(config),
            output,
            loss,
            auth,
            state: Arc::new(Mutex::new(SessionStateMachine::new())),
            manual_disconnect: Arc::new(AtomicBool::new(false)),
            link: Mutex::new(None),
            negotiation_window: NEGOTIATION_WINDOW,
            connected_since: Mutex::new(None),
        }
    }

    /// Override the terminal query negotiation window
    pub fn with_negotiation_window(mut self, window: Duration) -> Self {
        self.negotiation_window = window;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().state()
    }

    /// Reason the session last failed or ended, if any
    pub fn last_error(&self) -> Option<String> {
        self.state.lock().error().map(str::to_string)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub fn is_awaiting_auth_input(&self) -> bool {
        self.auth.is_pending()
    }

    pub fn pending_auth_prompt(&self) -> Option<AuthPrompt> {
        self.auth.pending_prompt()
    }

    /// Deliver credentials typed elsewhere to the pending auth prompt
    pub fn resolve_auth_prompt(&self, value: &str) -> bool {
        self.auth.resolve(value)
    }

    /// Snapshot of the config, with the live terminal size
    pub fn config(&self) -> ConnectionConfig {
        self.config.read().clone()
    }

    /// Current (cols, rows)
    pub fn terminal_size(&self) -> (u32, u32) {
        let config = self.config.read();
        (config.cols, config.rows)
    }

    /// When the PTY was established
    pub fn connected_since(&self) -> Option<DateTime<Utc>> {
        *self.connected_since.lock()
    }

    /// Connect, authenticate, allocate the PTY and start the read task
    ///
    /// Errors are returned as-is; nothing is retried.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let config = self.config();
        config.validate()?;
        self.state.lock().begin_connect()?;
        self.manual_disconnect.store(false, Ordering::SeqCst);

        info!("Session {} connecting to {}", self.id, config.address());

        let result = match client::establish(&config, &self.auth, &self.id).await {
            Ok(controller) => self.start_pty(Arc::new(controller), &config).await,
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            error!("Session {} connect failed: {}", self.id, e);
            self.state.lock().connect_failed(e);
        }
        result
    }

    /// Start the session on an already authenticated transport
    pub async fn attach(&self, transport: Arc<dyn Transport>) -> Result<(), SessionError> {
        let config = self.config();
        self.state.lock().begin_connect()?;
        self.manual_disconnect.store(false, Ordering::SeqCst);

        let result = self.start_pty(transport, &config).await;
        if let Err(e) = &result {
            error!("Session {} attach failed: {}", self.id, e);
            self.state.lock().connect_failed(e);
        }
        result
    }

    async fn start_pty(
        &self,
        transport: Arc<dyn Transport>,
        config: &ConnectionConfig,
    ) -> Result<(), SessionError> {
        let channel = match open_pty(transport.as_ref(), config).await {
            Ok(channel) => channel,
            Err(e) => {
                transport.disconnect().await;
                return Err(e);
            }
        };

        // Connected and a running reader become visible together
        let rejected = {
            let mut state = self.state.lock();
            match state.connect_succeeded() {
                Ok(()) => {
                    let link = self.spawn_reader(transport.clone(), channel);
                    *self.link.lock() = Some(link);
                    None
                }
                Err(e) => Some((channel, e)),
            }
        };

        if let Some((mut channel, e)) = rejected {
            warn!("Session {} was disconnected while connecting", self.id);
            let _ = channel.close().await;
            transport.disconnect().await;
            return Err(e);
        }

        *self.connected_since.lock() = Some(Utc::now());
        info!(
            "Interactive shell started for session {} ({}x{} {})",
            self.id, config.cols, config.rows, config.terminal_type
        );
        Ok(())
    }

    fn spawn_reader(&self, transport: Arc<dyn Transport>, channel: Box<dyn RemoteChannel>) -> Link {
        let (cmd_tx, cmd_rx) = mpsc::channel::<PtyCommand>(1024);
        let cancel = CancellationToken::new();

        let reader = tokio::spawn(run_read_loop(
            ReadLoop {
                session_id: self.id.clone(),
                output: self.output.clone(),
                loss: self.loss.clone(),
                state: self.state.clone(),
                manual_disconnect: self.manual_disconnect.clone(),
                transport: transport.clone(),
                responder: TerminalQueryResponder::starting_at(
                    tokio::time::Instant::now(),
                    self.negotiation_window,
                ),
            },
            channel,
            cmd_rx,
            cancel.clone(),
        ));

        Link {
            transport,
            cmd_tx,
            cancel,
            reader,
        }
    }

    /// Write raw bytes to the PTY; logged and dropped when not connected
    pub async fn send_input(&self, data: &[u8]) {
        let Some(cmd_tx) = self.live_sender() else {
            warn!("Cannot send input: session {} not connected", self.id);
            return;
        };
        if cmd_tx.send(PtyCommand::Data(data.to_vec())).await.is_err() {
            warn!("Session {} read task gone, input dropped", self.id);
        }
    }

    /// Propagate new geometry to the PTY; no-op when not connected
    pub async fn resize_terminal(&self, cols: u32, rows: u32) {
        let Some(cmd_tx) = self.live_sender() else {
            return;
        };
        if cmd_tx.send(PtyCommand::Resize(cols, rows)).await.is_err() {
            return;
        }
        let mut config = self.config.write();
        config.cols = cols;
        config.rows = rows;
        debug!("Session {} resized to {}x{}", self.id, cols, rows);
    }

    /// Run `command` on its own channel, isolated from the PTY
    pub async fn execute_command(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<String, SessionError> {
        CommandChannel::new(self.live_transport()?)
            .run(command, timeout)
            .await
    }

    /// Keepalive probe on the underlying connection
    pub async fn ping(&self) -> PingResult {
        match self.live_transport() {
            Ok(transport) => transport.ping().await,
            Err(_) => PingResult::IoError,
        }
    }

    /// Tear the session down; calling it again is a no-op
    pub async fn disconnect(&self) {
        self.manual_disconnect.store(true, Ordering::SeqCst);
        let began = self.state.lock().begin_disconnect();
        let link = self.link.lock().take();
        if !began && link.is_none() {
            return;
        }

        info!("Disconnecting session {}", self.id);
        self.auth.cancel();

        if let Some(link) = link {
            drop(link.cmd_tx);
            link.cancel.cancel();
            if let Err(e) = link.reader.await {
                warn!("Session {} read task ended abnormally: {}", self.id, e);
            }
            link.transport.disconnect().await;
        }

        self.state.lock().finish_disconnect();
        info!("Session {} disconnected", self.id);
    }

    fn live_sender(&self) -> Option<mpsc::Sender<PtyCommand>> {
        if !self.is_connected() {
            return None;
        }
        self.link.lock().as_ref().map(|link| link.cmd_tx.clone())
    }

    fn live_transport(&self) -> Result<Arc<dyn Transport>, SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        self.link
            .lock()
            .as_ref()
            .map(|link| link.transport.clone())
            .ok_or(SessionError::NotConnected)
    }

    #[cfg(test)]
    fn reader_running(&self) -> bool {
        self.link
            .lock()
            .as_ref()
            .is_some_and(|link| !link.reader.is_finished())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            debug!("Dropping live session {}", self.id);
            self.manual_disconnect.store(true, Ordering::SeqCst);
            link.cancel.cancel();
        }
    }
}

async fn open_pty(
    transport: &dyn Transport,
    config: &ConnectionConfig,
) -> Result<Box<dyn RemoteChannel>, SessionError> {
    let mut channel = transport.open_channel().await?;
    channel
        .request_pty(&config.terminal_type, config.cols, config.rows)
        .await?;
    debug!("PTY allocated, requesting shell");
    channel.request_shell().await?;
    Ok(channel)
}

/// State the read task carries
struct ReadLoop {
    session_id: String,
    output: Arc<dyn OutputSink>,
    loss: Arc<dyn LossListener>,
    state: Arc<Mutex<SessionStateMachine>>,
    manual_disconnect: Arc<AtomicBool>,
    transport: Arc<dyn Transport>,
    responder: TerminalQueryResponder,
}

/// One bounded read from the PTY
async fn read_chunk(channel: &mut dyn RemoteChannel) -> Result<Vec<u8>, ReadError> {
    match tokio::time::timeout(READ_POLL_INTERVAL, channel.recv()).await {
        Err(_) => Err(ReadError::Timeout),
        Ok(None) => Err(ReadError::ConnectionLost),
        Ok(Some(ChannelEvent::Stdout(data) | ChannelEvent::Stderr(data))) => Ok(data),
        Ok(Some(ChannelEvent::Eof | ChannelEvent::Closed | ChannelEvent::ExitStatus(_))) => {
            Err(ReadError::ChannelClosed)
        }
        Ok(Some(ChannelEvent::Other)) => Ok(Vec::new()),
    }
}

async fn run_read_loop(
    mut ctx: ReadLoop,
    mut channel: Box<dyn RemoteChannel>,
    mut cmd_rx: mpsc::Receiver<PtyCommand>,
    cancel: CancellationToken,
) {
    let sid = ctx.session_id.clone();
    debug!("Read loop started for session {}", sid);

    let exit = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break LoopExit::Cancelled,

            Some(cmd) = cmd_rx.recv() => match cmd {
                PtyCommand::Data(data) => {
                    if let Err(e) = channel.data(&data).await {
                        break LoopExit::Ended(ReadError::Other(e.to_string()));
                    }
                }
                PtyCommand::Resize(cols, rows) => {
                    if let Err(e) = channel.window_change(cols, rows).await {
                        warn!("Failed to resize PTY for session {}: {}", sid, e);
                    }
                }
            },

            read = read_chunk(channel.as_mut()) => match read {
                Ok(data) if data.is_empty() => {}
                Ok(data) => {
                    ctx.output.on_output(&data);
                    if ctx.responder.in_window() {
                        for reply in ctx.responder.on_inbound_bytes(&data) {
                            if let Err(e) = channel.data(reply).await {
                                warn!("Failed to answer terminal query for session {}: {}", sid, e);
                            }
                        }
                    }
                }
                Err(ReadError::Timeout) => {}
                Err(e) => break LoopExit::Ended(e),
            },
        }
    };

    if let Err(e) = channel.close().await {
        debug!("Closing PTY channel for session {}: {}", sid, e);
    }

    let reason = match exit {
        LoopExit::Cancelled => {
            debug!("Read loop cancelled for session {}", sid);
            return;
        }
        LoopExit::Ended(reason) => reason,
    };

    let detail = match &reason {
        ReadError::ChannelClosed => {
            info!("SSH channel closed by remote for session {}", sid);
            None
        }
        ReadError::ConnectionLost => {
            warn!("SSH connection lost for session {}", sid);
            Some(reason.to_string())
        }
        ReadError::Other(e) => {
            error!("SSH channel failure for session {}: {}", sid, e);
            Some(reason.to_string())
        }
        ReadError::Timeout => None,
    };

    let was_live = ctx.state.lock().channel_ended(detail);
    if was_live && !ctx.manual_disconnect.load(Ordering::SeqCst) {
        info!("Session {} lost unexpectedly", sid);
        ctx.transport.disconnect().await;
        ctx.loss.on_unexpected_loss();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::query_responder::DEVICE_ATTRIBUTES_REPLY;
    use crate::ssh::testing::{CapturedOutput, FakeTransport, LossCounter, Script};

    struct Harness {
        session: Session,
        transport: FakeTransport,
        output: Arc<CapturedOutput>,
        loss: Arc<LossCounter>,
    }

    fn harness() -> Harness {
        let output = Arc::new(CapturedOutput::default());
        let loss = Arc::new(LossCounter::default());
        let config = ConnectionConfig::new("router", 22, "admin").with_size(80, 24);
        Harness {
            session: Session::new(config, output.clone(), loss.clone()),
            transport: FakeTransport::new(),
            output,
            loss,
        }
    }

    async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting for {}", what);
    }

    fn count_writes(transport: &FakeTransport, bytes: &[u8]) -> usize {
        transport.writes().iter().filter(|w| w.as_slice() == bytes).count()
    }

    #[tokio::test]
    async fn test_attach_and_disconnect() {
        let h = harness();
        h.session.attach(h.transport.shared()).await.unwrap();

        assert!(h.session.is_connected());
        assert!(h.session.reader_running());
        assert!(h.session.connected_since().is_some());
        assert_eq!(h.transport.pty_requests(), vec![("xterm".to_string(), 80, 24)]);

        h.session.disconnect().await;
        assert!(!h.session.is_connected());
        assert!(!h.session.reader_running());
        assert_eq!(h.session.state(), SessionState::Disconnected);
        assert_eq!(h.transport.closed_channels(), 1);
        assert_eq!(h.transport.disconnects(), 1);
        assert_eq!(h.loss.count(), 0);

        // Idempotent
        h.session.disconnect().await;
        assert_eq!(h.transport.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_output_forwarded_and_da1_answered_once() {
        let h = harness();
        h.session.attach(h.transport.shared()).await.unwrap();

        h.transport.remote_output(b"[admin@MikroTik] > \x1b[c");
        wait_for("first query answered", || {
            count_writes(&h.transport, DEVICE_ATTRIBUTES_REPLY) == 1
        })
        .await;
        assert!(h.output.text().contains("[admin@MikroTik] > "));

        h.transport.remote_output(b"\x1b[c");
        h.transport.remote_output(b"marker");
        wait_for("marker", || h.output.text().ends_with("marker")).await;
        assert_eq!(count_writes(&h.transport, DEVICE_ATTRIBUTES_REPLY), 1);

        h.session.disconnect().await;
    }

    #[tokio::test]
    async fn test_queries_ignored_outside_window() {
        let mut h = harness();
        h.session = h.session.with_negotiation_window(Duration::ZERO);
        h.session.attach(h.transport.shared()).await.unwrap();

        h.transport.remote_output(b"\x1b[c\x1b[6n");
        h.transport.remote_output(b"marker");
        wait_for("marker", || h.output.text().ends_with("marker")).await;
        assert!(h.transport.writes().is_empty());

        h.session.disconnect().await;
    }

    #[tokio::test]
    async fn test_remote_eof_reports_loss_once() {
        let h = harness();
        h.session.attach(h.transport.shared()).await.unwrap();

        h.transport.remote_event(ChannelEvent::Eof);
        wait_for("loss callback", || h.loss.count() == 1).await;
        assert!(!h.session.is_connected());
        assert_eq!(h.transport.disconnects(), 1);

        // A later manual disconnect adds nothing
        h.session.disconnect().await;
        assert_eq!(h.loss.count(), 1);
        assert!(h.session.last_error().is_none());
    }

    #[tokio::test]
    async fn test_dropped_connection_reports_loss() {
        let h = harness();
        h.session.attach(h.transport.shared()).await.unwrap();

        h.transport.drop_connection();
        wait_for("loss callback", || h.loss.count() == 1).await;
        assert_eq!(h.session.state(), SessionState::Disconnected);
        assert_eq!(h.session.last_error().as_deref(), Some("connection lost"));
    }

    #[tokio::test]
    async fn test_manual_disconnect_is_silent() {
        let h = harness();
        h.session.attach(h.transport.shared()).await.unwrap();

        h.session.disconnect().await;
        h.transport.remote_event(ChannelEvent::Eof);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.loss.count(), 0);
    }

    #[tokio::test]
    async fn test_input_in_order_and_dropped_when_disconnected() {
        let h = harness();
        h.session.send_input(b"ignored").await;

        h.session.attach(h.transport.shared()).await.unwrap();
        h.session.send_input(b"/system ").await;
        h.session.send_input(b"resource print\r").await;
        wait_for("input", || h.transport.writes().len() == 2).await;
        assert_eq!(
            h.transport.writes(),
            vec![b"/system ".to_vec(), b"resource print\r".to_vec()]
        );

        h.session.disconnect().await;
        h.session.send_input(b"late").await;
        assert_eq!(h.transport.writes().len(), 2);
    }

    #[tokio::test]
    async fn test_resize_updates_geometry() {
        let h = harness();
        h.session.resize_terminal(120, 50).await;
        assert_eq!(h.session.terminal_size(), (80, 24));

        h.session.attach(h.transport.shared()).await.unwrap();
        h.session.resize_terminal(100, 40).await;
        assert_eq!(h.session.terminal_size(), (100, 40));
        assert_eq!(h.session.config().cols, 100);
        wait_for("window change", || h.transport.resizes() == vec![(100, 40)]).await;

        h.session.disconnect().await;
    }

    #[tokio::test]
    async fn test_execute_command_isolated_from_pty() {
        let h = harness();
        assert!(matches!(
            h.session.execute_command("uptime", Duration::from_secs(1)).await,
            Err(SessionError::NotConnected)
        ));

        h.session.attach(h.transport.shared()).await.unwrap();
        h.transport.script_exec(Script::Finish {
            stdout: b"up 3 days\n".to_vec(),
            stderr: Vec::new(),
            exit_status: 0,
        });
        let text = h
            .session
            .execute_command("uptime", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(text, "up 3 days\n");
        assert!(h.session.is_connected());
        assert!(h.output.text().is_empty());

        h.session.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_command_timeout() {
        let h = harness();
        h.session.attach(h.transport.shared()).await.unwrap();
        h.transport.script_exec(Script::Hang);

        let started = tokio::time::Instant::now();
        let err = h
            .session
            .execute_command("sleep 60", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(h.session.is_connected());

        h.session.disconnect().await;
    }

    #[tokio::test]
    async fn test_not_reusable_and_config_checked() {
        let output = Arc::new(CapturedOutput::default());
        let session = Session::new(
            ConnectionConfig::new("router", 22, ""),
            output,
            Arc::new(LossCounter::default()),
        );
        assert!(matches!(session.connect().await, Err(SessionError::Config(_))));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.resolve_auth_prompt("nobody asked"));
        assert!(!session.is_awaiting_auth_input());

        let h = harness();
        h.session.attach(h.transport.shared()).await.unwrap();
        h.session.disconnect().await;
        assert!(matches!(
            h.session.attach(FakeTransport::new().shared()).await,
            Err(SessionError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_pty_failure_disconnects_transport() {
        let h = harness();
        h.transport.fail_next_open();
        assert!(h.session.attach(h.transport.shared()).await.is_err());
        assert_eq!(h.session.state(), SessionState::Disconnected);
        assert_eq!(h.transport.disconnects(), 1);
        assert_eq!(h.session.ping().await, PingResult::IoError);
    }
}
