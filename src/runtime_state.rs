// =============================================================================
// Runtime State — Shared observable record for heartbeat and commands
// =============================================================================
//
// A single mutable record guarded by a mutex. The stream path mutates it
// through short, await-free critical sections; command handlers and the
// heartbeat read deep-copied snapshots.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::types::{Side, WallEventKind};

/// Connection state of the upstream market-data stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Idle,
    Connecting,
    Connected,
    Backoff,
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Backoff => write!(f, "backoff"),
        }
    }
}

/// Compact summary of the most recent wall lifecycle event.
#[derive(Debug, Clone, Serialize)]
pub struct WallEventSummary {
    pub kind: WallEventKind,
    pub ts: DateTime<Utc>,
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub qty: f64,
}

/// Owned, immutable view of the runtime state.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStateSnapshot {
    pub started_at: DateTime<Utc>,
    pub pid: u32,
    pub stream_state: StreamState,
    pub since_last_message_seconds: Option<f64>,
    pub rx_total_orderbooks: u64,
    pub rx_total_trades: u64,
    pub current_symbols: Vec<String>,
    pub depth: u32,
    pub last_wall_event: Option<WallEventSummary>,
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct Inner {
    started_at: DateTime<Utc>,
    pid: u32,
    stream_state: StreamState,
    since_last_message_seconds: Option<f64>,
    rx_total_orderbooks: u64,
    rx_total_trades: u64,
    current_symbols: Vec<String>,
    depth: u32,
    last_wall_event: Option<WallEventSummary>,
    last_error: Option<String>,
}

/// Mutex-guarded runtime record shared across tasks.
pub struct RuntimeState {
    inner: Mutex<Inner>,
}

impl RuntimeState {
    pub fn new(depth: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                started_at: Utc::now(),
                pid: std::process::id(),
                stream_state: StreamState::Connecting,
                since_last_message_seconds: None,
                rx_total_orderbooks: 0,
                rx_total_trades: 0,
                current_symbols: Vec::new(),
                depth,
                last_wall_event: None,
                last_error: None,
            }),
        }
    }

    /// Apply a mutation under the lock. The closure must not block.
    pub fn update(&self, apply: impl FnOnce(&mut RuntimeStateView<'_>)) {
        let mut guard = self.inner.lock();
        let mut view = RuntimeStateView { inner: &mut guard };
        apply(&mut view);
    }

    /// Deep-copied, immutable view of the current state.
    pub fn snapshot(&self) -> RuntimeStateSnapshot {
        let inner = self.inner.lock();
        RuntimeStateSnapshot {
            started_at: inner.started_at,
            pid: inner.pid,
            stream_state: inner.stream_state,
            since_last_message_seconds: inner.since_last_message_seconds,
            rx_total_orderbooks: inner.rx_total_orderbooks,
            rx_total_trades: inner.rx_total_trades,
            current_symbols: inner.current_symbols.clone(),
            depth: inner.depth,
            last_wall_event: inner.last_wall_event.clone(),
            last_error: inner.last_error.clone(),
        }
    }
}

/// Mutable view handed to `update` closures.
pub struct RuntimeStateView<'a> {
    inner: &'a mut Inner,
}

impl RuntimeStateView<'_> {
    pub fn set_stream_state(&mut self, state: StreamState) {
        self.inner.stream_state = state;
    }

    pub fn set_since_last_message_seconds(&mut self, value: Option<f64>) {
        self.inner.since_last_message_seconds = value;
    }

    pub fn set_rx_total_orderbooks(&mut self, value: u64) {
        self.inner.rx_total_orderbooks = value;
    }

    pub fn set_rx_total_trades(&mut self, value: u64) {
        self.inner.rx_total_trades = value;
    }

    pub fn set_current_symbols(&mut self, symbols: Vec<String>) {
        self.inner.current_symbols = symbols;
    }

    pub fn set_depth(&mut self, depth: u32) {
        self.inner.depth = depth;
    }

    pub fn set_last_wall_event(&mut self, event: WallEventSummary) {
        self.inner.last_wall_event = Some(event);
    }

    pub fn set_last_error(&mut self, error: Option<String>) {
        self.inner.last_error = error;
    }
}
