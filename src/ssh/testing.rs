//! In-memory transport and channels for exercising the session engine

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::channel::{ChannelEvent, RemoteChannel, Transport};
use super::error::SessionError;
use super::events::{LossListener, OutputSink};
use super::handle_owner::PingResult;

/// What an exec channel does once the command is sent
#[derive(Debug, Clone)]
pub enum Script {
    Finish {
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        exit_status: u32,
    },
    /// Never produces anything
    Hang,
}

#[derive(Default)]
struct Recorded {
    pty_requests: Vec<(String, u32, u32)>,
    writes: Vec<Vec<u8>>,
    resizes: Vec<(u32, u32)>,
    executed: Vec<String>,
    scripts: VecDeque<Script>,
}

/// Cloneable handle to one fake connection
#[derive(Clone)]
pub struct FakeTransport {
    inner: Arc<Shared>,
}

struct Shared {
    recorded: Mutex<Recorded>,
    remote_tx: Mutex<Option<mpsc::UnboundedSender<ChannelEvent>>>,
    remote_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    fail_open: AtomicBool,
    alive: AtomicBool,
    closed_channels: AtomicUsize,
    disconnects: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Shared {
            recorded: Mutex::new(Recorded::default()),
            remote_tx: Mutex::new(Some(tx)),
            remote_rx: Mutex::new(Some(rx)),
            fail_open: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            closed_channels: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        });
        Self { inner }
    }

    pub fn shared(&self) -> Arc<dyn Transport> {
        Arc::new(self.clone())
    }

    /// Bytes arriving from the remote shell
    pub fn remote_output(&self, data: &[u8]) {
        self.remote_event(ChannelEvent::Stdout(data.to_vec()));
    }

    pub fn remote_event(&self, event: ChannelEvent) {
        if let Some(tx) = self.inner.remote_tx.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// The interactive channel vanishes without EOF
    pub fn drop_connection(&self) {
        self.inner.alive.store(false, Ordering::SeqCst);
        self.inner.remote_tx.lock().take();
    }

    pub fn script_exec(&self, script: Script) {
        self.inner.recorded.lock().scripts.push_back(script);
    }

    pub fn fail_next_open(&self) {
        self.inner.fail_open.store(true, Ordering::SeqCst);
    }

    pub fn pty_requests(&self) -> Vec<(String, u32, u32)> {
        self.inner.recorded.lock().pty_requests.clone()
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.inner.recorded.lock().writes.clone()
    }

    pub fn resizes(&self) -> Vec<(u32, u32)> {
        self.inner.recorded.lock().resizes.clone()
    }

    pub fn executed(&self) -> Vec<String> {
        self.inner.recorded.lock().executed.clone()
    }

    pub fn closed_channels(&self) -> usize {
        self.inner.closed_channels.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.inner.disconnects.load(Ordering::SeqCst)
    }
}

enum Mode {
    Fresh,
    Pty(mpsc::UnboundedReceiver<ChannelEvent>),
    Exec(VecDeque<ChannelEvent>),
    Hang,
}

pub struct FakeChannel {
    transport: FakeTransport,
    mode: Mode,
}

#[async_trait]
impl RemoteChannel for FakeChannel {
    async fn request_pty(&mut self, term: &str, cols: u32, rows: u32) -> Result<(), SessionError> {
        self.transport
            .inner
            .recorded
            .lock()
            .pty_requests
            .push((term.to_string(), cols, rows));
        let rx = self
            .transport
            .inner
            .remote_rx
            .lock()
            .take()
            .ok_or_else(|| SessionError::Channel("PTY already allocated".to_string()))?;
        self.mode = Mode::Pty(rx);
        Ok(())
    }

    async fn request_shell(&mut self) -> Result<(), SessionError> {
        Ok(())
    }

    async fn exec(&mut self, command: &str) -> Result<(), SessionError> {
        let mut recorded = self.transport.inner.recorded.lock();
        recorded.executed.push(command.to_string());
        self.mode = match recorded.scripts.pop_front() {
            Some(Script::Finish {
                stdout,
                stderr,
                exit_status,
            }) => Mode::Exec(VecDeque::from(vec![
                ChannelEvent::Stdout(stdout),
                ChannelEvent::Stderr(stderr),
                ChannelEvent::Eof,
                ChannelEvent::ExitStatus(exit_status),
                ChannelEvent::Closed,
            ])),
            Some(Script::Hang) => Mode::Hang,
            None => Mode::Exec(VecDeque::from(vec![ChannelEvent::Closed])),
        };
        Ok(())
    }

    async fn data(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        self.transport.inner.recorded.lock().writes.push(bytes.to_vec());
        Ok(())
    }

    async fn window_change(&mut self, cols: u32, rows: u32) -> Result<(), SessionError> {
        self.transport.inner.recorded.lock().resizes.push((cols, rows));
        Ok(())
    }

    async fn recv(&mut self) -> Option<ChannelEvent> {
        match &mut self.mode {
            Mode::Pty(rx) => rx.recv().await,
            Mode::Exec(events) => events.pop_front(),
            Mode::Hang => std::future::pending().await,
            Mode::Fresh => None,
        }
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.transport.inner.closed_channels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open_channel(&self) -> Result<Box<dyn RemoteChannel>, SessionError> {
        if self.inner.fail_open.swap(false, Ordering::SeqCst) {
            return Err(SessionError::Channel("open refused".to_string()));
        }
        Ok(Box::new(FakeChannel {
            transport: self.clone(),
            mode: Mode::Fresh,
        }))
    }

    async fn ping(&self) -> PingResult {
        if self.is_alive() {
            PingResult::Ok
        } else {
            PingResult::IoError
        }
    }

    async fn disconnect(&self) {
        self.inner.alive.store(false, Ordering::SeqCst);
        self.inner.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }
}

/// Output sink that keeps everything it was given
#[derive(Default)]
pub struct CapturedOutput(Mutex<Vec<u8>>);

impl CapturedOutput {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl OutputSink for CapturedOutput {
    fn on_output(&self, data: &[u8]) {
        self.0.lock().extend_from_slice(data);
    }
}

/// Loss listener that counts notifications
#[derive(Default)]
pub struct LossCounter(AtomicUsize);

impl LossCounter {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl LossListener for LossCounter {
    fn on_unexpected_loss(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}
