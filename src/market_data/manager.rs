// =============================================================================
// Market-Data Manager — subscription set and stream supervision
// =============================================================================
//
// Owns the mutable set of subscribed symbols and keeps one streaming session
// alive against it: resolve symbols, build a fresh detector, pump stream
// messages through it in arrival order, and funnel the resulting alerts and
// lifecycle events to the notifiers. Symbol mutations signal a restart
// condition that preempts the current session without touching the global
// stop; failures back off exponentially.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::market_data::client::{MarketDataApi, StreamMessage};
use crate::notifier::Notifier;
use crate::runtime_state::{RuntimeState, StreamState, WallEventSummary};
use crate::telegram::notifier::TelegramNotifier;
use crate::types::WallEvent;
use crate::wall_detector::{DetectorConfig, WallDetector};

/// Capacity of the stream → detector channel.
const STREAM_CHANNEL_CAPACITY: usize = 1024;

/// Wake period for the idle wait so an empty watch list still observes stop.
const IDLE_WAKE_SECONDS: u64 = 1;

/// Manager knobs beyond the detector config itself.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub detector: DetectorConfig,
    pub debug_enabled: bool,
    pub debug_interval_seconds: f64,
    pub retry_backoff_initial_seconds: f64,
    pub retry_backoff_max_seconds: f64,
}

/// Normalize a raw symbol list: trim, uppercase, drop empties, dedupe while
/// preserving first-seen order. Idempotent.
pub fn normalize_symbols(symbols: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    symbols
        .iter()
        .map(|symbol| symbol.trim().to_uppercase())
        .filter(|symbol| !symbol.is_empty())
        .filter(|symbol| seen.insert(symbol.clone()))
        .collect()
}

/// Mutation surface exposed to the command layer.
pub trait SubscriptionControl: Send + Sync {
    fn update_symbols(&self, symbols: Vec<String>);
    fn get_symbols(&self) -> Vec<String>;
}

struct ManagerInner {
    config: ManagerConfig,
    client: Arc<dyn MarketDataApi>,
    runtime_state: Arc<RuntimeState>,
    telegram: Option<Arc<TelegramNotifier>>,
    alert_notifier: Arc<dyn Notifier>,
    symbols: Mutex<Vec<String>>,
    restart: Notify,
    stop: watch::Receiver<bool>,
    rx_orderbooks_interval: AtomicU64,
    rx_trades_interval: AtomicU64,
    rx_total_orderbooks: AtomicU64,
    rx_total_trades: AtomicU64,
    last_message: Mutex<Option<Instant>>,
}

/// Supervises the always-on streaming session over the current symbol set.
pub struct MarketDataManager {
    inner: Arc<ManagerInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MarketDataManager {
    pub fn new(
        config: ManagerConfig,
        client: Arc<dyn MarketDataApi>,
        runtime_state: Arc<RuntimeState>,
        telegram: Option<Arc<TelegramNotifier>>,
        alert_notifier: Arc<dyn Notifier>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                client,
                runtime_state,
                telegram,
                alert_notifier,
                symbols: Mutex::new(Vec::new()),
                restart: Notify::new(),
                stop,
                rx_orderbooks_interval: AtomicU64::new(0),
                rx_trades_interval: AtomicU64::new(0),
                rx_total_orderbooks: AtomicU64::new(0),
                rx_total_trades: AtomicU64::new(0),
                last_message: Mutex::new(None),
            }),
            task: Mutex::new(None),
        }
    }

    /// Set the initial symbols and spawn the supervision task.
    pub fn start(&self, symbols: Vec<String>) {
        self.update_symbols(symbols);
        let mut task = self.task.lock();
        if task.is_none() {
            let inner = self.inner.clone();
            *task = Some(tokio::spawn(run_supervisor(inner)));
        }
    }

    /// Wait for the supervision task to finish. The global stop signal must
    /// already be set for this to return promptly.
    pub async fn stop(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Orderbook / trade counts received since the previous call.
    pub fn consume_interval_counts(&self) -> (u64, u64) {
        (
            self.inner.rx_orderbooks_interval.swap(0, Ordering::Relaxed),
            self.inner.rx_trades_interval.swap(0, Ordering::Relaxed),
        )
    }

    /// Age of the most recent stream message, if any arrived yet.
    pub fn last_message_age_seconds(&self) -> Option<f64> {
        self.inner
            .last_message
            .lock()
            .map(|instant| instant.elapsed().as_secs_f64())
    }
}

impl SubscriptionControl for MarketDataManager {
    fn update_symbols(&self, symbols: Vec<String>) {
        let normalized = normalize_symbols(&symbols);
        *self.inner.symbols.lock() = normalized.clone();
        self.inner
            .runtime_state
            .update(|s| s.set_current_symbols(normalized));
        self.inner.restart.notify_one();
    }

    fn get_symbols(&self) -> Vec<String> {
        self.inner.symbols.lock().clone()
    }
}

// =============================================================================
// Supervision loop
// =============================================================================

async fn run_supervisor(inner: Arc<ManagerInner>) {
    let mut stop = inner.stop.clone();
    let mut backoff = inner.config.retry_backoff_initial_seconds;
    loop {
        if *stop.borrow() {
            return;
        }
        let symbols = inner.symbols.lock().clone();
        if symbols.is_empty() {
            inner
                .runtime_state
                .update(|s| s.set_stream_state(StreamState::Idle));
            tokio::select! {
                _ = inner.restart.notified() => {}
                _ = tokio::time::sleep(Duration::from_secs(IDLE_WAKE_SECONDS)) => {}
                _ = stop.changed() => {}
            }
            continue;
        }

        match stream_session(&inner, &symbols, &mut stop).await {
            Ok(()) => {
                backoff = inner.config.retry_backoff_initial_seconds;
            }
            Err(error) => {
                if *stop.borrow() {
                    return;
                }
                error!(error = %error, "stream_failed");
                inner.runtime_state.update(|s| {
                    s.set_stream_state(StreamState::Backoff);
                    s.set_last_error(Some(error.to_string()));
                });
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs_f64(backoff)) => {}
                    _ = stop.changed() => {}
                }
                backoff = (backoff * 2.0).min(inner.config.retry_backoff_max_seconds);
            }
        }
    }
}

async fn stream_session(
    inner: &Arc<ManagerInner>,
    symbols: &[String],
    stop: &mut watch::Receiver<bool>,
) -> Result<()> {
    inner.runtime_state.update(|s| {
        s.set_stream_state(StreamState::Connecting);
        s.set_last_error(None);
    });
    info!(symbols = ?symbols, "connecting");

    let (resolved, failures) = inner.client.resolve_instruments(symbols).await?;
    for symbol in &failures {
        warn!(symbol = %symbol, "instrument_not_found");
    }
    if resolved.is_empty() {
        anyhow::bail!("no instruments resolved");
    }

    // A fresh detector per session: state resynchronizes from live data.
    let mut detector = WallDetector::new(inner.config.detector);
    for info in &resolved {
        detector.upsert_instrument(&info.instrument_id, info.tick_size, &info.symbol);
    }
    if let Some(telegram) = &inner.telegram {
        telegram.update_instruments(
            resolved
                .iter()
                .map(|info| (info.symbol.clone(), info.clone()))
                .collect(),
        );
    }

    let (tx, mut rx) = mpsc::channel::<StreamMessage>(STREAM_CHANNEL_CAPACITY);
    let stream = inner.client.stream_market_data(
        &resolved,
        inner.config.detector.depth,
        tx,
        stop.clone(),
    );
    tokio::pin!(stream);

    let mut connected = false;
    loop {
        tokio::select! {
            result = &mut stream => {
                // Drain whatever arrived before the stream wound down.
                while let Ok(message) = rx.try_recv() {
                    dispatch(inner, &mut detector, &mut connected, message);
                }
                return result;
            }
            maybe_message = rx.recv() => match maybe_message {
                Some(message) => dispatch(inner, &mut detector, &mut connected, message),
                None => return stream.await,
            },
            _ = inner.restart.notified() => {
                while let Ok(message) = rx.try_recv() {
                    dispatch(inner, &mut detector, &mut connected, message);
                }
                return Ok(());
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    while let Ok(message) = rx.try_recv() {
                        dispatch(inner, &mut detector, &mut connected, message);
                    }
                    return Ok(());
                }
            }
        }
    }
}

fn dispatch(
    inner: &Arc<ManagerInner>,
    detector: &mut WallDetector,
    connected: &mut bool,
    message: StreamMessage,
) {
    *inner.last_message.lock() = Some(Instant::now());
    if !*connected {
        *connected = true;
        inner
            .runtime_state
            .update(|s| s.set_stream_state(StreamState::Connected));
        info!("connected");
    }

    match message {
        StreamMessage::OrderBook(snapshot) => {
            inner.rx_orderbooks_interval.fetch_add(1, Ordering::Relaxed);
            let total = inner.rx_total_orderbooks.fetch_add(1, Ordering::Relaxed) + 1;
            inner
                .runtime_state
                .update(|s| s.set_rx_total_orderbooks(total));

            let (alerts, events, debug) = if inner.config.debug_enabled {
                detector.on_order_book_with_debug(&snapshot, inner.config.debug_interval_seconds)
            } else {
                let (alerts, events) = detector.on_order_book_with_events(&snapshot);
                (alerts, events, None)
            };
            for event in events {
                handle_event(inner, event);
            }
            if let Some(payload) = debug {
                info!(
                    symbol = %payload.symbol,
                    state = payload.state,
                    best_bid = ?payload.best_bid,
                    best_ask = ?payload.best_ask,
                    spread = ?payload.spread,
                    candidate_price = ?payload.candidate_price,
                    candidate_qty = ?payload.candidate_qty,
                    qty_ratio_to_median = ?payload.qty_ratio_to_median,
                    dwell_seconds = payload.dwell_seconds,
                    qty_change_last_interval = payload.qty_change_last_interval,
                    teleport_detected = payload.teleport_detected,
                    "wall_debug"
                );
            }
            for alert in &alerts {
                inner.alert_notifier.notify(alert);
            }
        }
        StreamMessage::Trade(trade) => {
            inner.rx_trades_interval.fetch_add(1, Ordering::Relaxed);
            let total = inner.rx_total_trades.fetch_add(1, Ordering::Relaxed) + 1;
            inner.runtime_state.update(|s| s.set_rx_total_trades(total));
            detector.on_trade(trade);
        }
    }
}

fn handle_event(inner: &Arc<ManagerInner>, event: WallEvent) {
    info!(
        symbol = %event.symbol,
        side = %event.side,
        price = event.price,
        qty = event.qty,
        wall_key = %event.wall_key,
        distance_ticks = event.distance_ticks,
        distance_ticks_to_spread = ?event.distance_ticks_to_spread,
        ratio_to_median = event.ratio_to_median,
        dwell_seconds = event.dwell_seconds,
        qty_change_last_interval = event.qty_change_last_interval,
        reason = ?event.reason.map(|reason| reason.as_str()),
        "{}",
        event.kind
    );
    inner.runtime_state.update(|s| {
        s.set_last_wall_event(WallEventSummary {
            kind: event.kind,
            ts: event.ts,
            symbol: event.symbol.clone(),
            side: event.side,
            price: event.price,
            qty: event.qty,
        })
    });
    if let Some(telegram) = &inner.telegram {
        telegram.notify(&event);
    }
}
