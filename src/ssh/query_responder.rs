//! Terminal capability query responder
//!
//! Some network devices (RouterOS in particular) probe the terminal right
//! after the PTY comes up and hold back colour output, or stall, until they
//! get an answer. The responder watches inbound bytes for a fixed set of
//! queries and produces the replies a VT220-class terminal would send.
//!
//! Each query kind is answered at most once per session, and only inside the
//! negotiation window that opens when the PTY is established.

use std::collections::HashSet;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// How long after PTY establishment queries are answered
pub const NEGOTIATION_WINDOW: Duration = Duration::from_secs(5);

/// Reply to DA1 and DECID: VT220, 132 columns, printer, selective erase, NRCS
pub const DEVICE_ATTRIBUTES_REPLY: &[u8] = b"\x1b[?62;1;2;6;8c";
/// Reply to DA2: VT220, firmware 10, ROM 0
pub const SECONDARY_ATTRIBUTES_REPLY: &[u8] = b"\x1b[>1;10;0c";
pub const CURSOR_POSITION_REPLY: &[u8] = b"\x1b[1;1R";
pub const STATUS_OK_REPLY: &[u8] = b"\x1b[0n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    /// DA1, `CSI c` / `CSI 0 c`
    PrimaryDeviceAttributes,
    /// DA2, `CSI > c` / `CSI > 0 c`
    SecondaryDeviceAttributes,
    /// DECID, `ESC Z`
    TerminalId,
    /// DSR 6, `CSI 6 n`
    CursorPosition,
    /// DSR 5, `CSI 5 n`
    DeviceStatus,
}

/// One entry of the built-in table
pub struct QueryRule {
    pub kind: QueryKind,
    pub patterns: &'static [&'static [u8]],
    pub response: &'static [u8],
}

/// The table, in the order replies are emitted when several match one chunk
pub const QUERY_RULES: &[QueryRule] = &[
    QueryRule {
        kind: QueryKind::PrimaryDeviceAttributes,
        patterns: &[b"\x1b[c", b"\x1b[0c"],
        response: DEVICE_ATTRIBUTES_REPLY,
    },
    QueryRule {
        kind: QueryKind::SecondaryDeviceAttributes,
        patterns: &[b"\x1b[>c", b"\x1b[>0c"],
        response: SECONDARY_ATTRIBUTES_REPLY,
    },
    QueryRule {
        kind: QueryKind::TerminalId,
        patterns: &[b"\x1bZ"],
        response: DEVICE_ATTRIBUTES_REPLY,
    },
    QueryRule {
        kind: QueryKind::CursorPosition,
        patterns: &[b"\x1b[6n"],
        response: CURSOR_POSITION_REPLY,
    },
    QueryRule {
        kind: QueryKind::DeviceStatus,
        patterns: &[b"\x1b[5n"],
        response: STATUS_OK_REPLY,
    },
];

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Per-session responder state
#[derive(Debug)]
pub struct TerminalQueryResponder {
    started: Instant,
    window: Duration,
    answered: HashSet<QueryKind>,
}

impl TerminalQueryResponder {
    /// Start a responder whose window opens now
    pub fn new() -> Self {
        Self::starting_at(Instant::now(), NEGOTIATION_WINDOW)
    }

    pub fn starting_at(started: Instant, window: Duration) -> Self {
        Self {
            started,
            window,
            answered: HashSet::new(),
        }
    }

    pub fn in_window(&self) -> bool {
        self.started.elapsed() < self.window
    }

    pub fn has_answered(&self, kind: QueryKind) -> bool {
        self.answered.contains(&kind)
    }

    /// Inspect an inbound chunk and return the replies to write, in table order
    pub fn on_inbound_bytes(&mut self, chunk: &[u8]) -> Vec<&'static [u8]> {
        if !self.in_window() {
            return Vec::new();
        }

        let mut replies = Vec::new();
        for rule in QUERY_RULES {
            if self.answered.contains(&rule.kind) {
                continue;
            }
            if rule.patterns.iter().any(|p| contains(chunk, p)) {
                debug!("Answering terminal query {:?}", rule.kind);
                self.answered.insert(rule.kind);
                replies.push(rule.response);
            }
        }
        replies
    }
}

impl Default for TerminalQueryResponder {
    fn default() -> Self {
        Self::new()
    }
}
