// =============================================================================
// Wall Detector — Per-instrument order-book wall state machine
// =============================================================================
//
// A "wall" is a price level whose resting size is anomalously large compared
// to neighbouring levels. The detector classifies top-of-book anomalies as
// candidates, then confirms them against time-persistence and absorption
// evidence, flags consumption once a confirmed wall is drawn down, and
// reports teleports (a wall re-appearing one tick away with near-identical
// size — a spoof signal).
//
// The detector is synchronous and deterministic: given the same configuration
// and the same sequence of snapshots and trades it emits the same alerts and
// lifecycle events. It never fails on market data; malformed inputs simply
// produce no candidate.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::types::{
    seconds_between, Alert, AlertKind, OrderBookSnapshot, Side, ThresholdSnapshot, Trade,
    WallCandidate, WallEvent, WallEventKind, WallLostReason,
};

/// Division guard for every denominator in the wall math.
const EPS: f64 = 1e-9;

/// Cap on the per-wall size-history deque.
const SIZE_HISTORY_CAP: usize = 200;

// =============================================================================
// Configuration
// =============================================================================

/// Tunable parameters of the wall engine.
#[derive(Debug, Clone, Copy)]
pub struct DetectorConfig {
    /// Cap on the watch list, enforced at the command layer.
    pub max_symbols: usize,
    /// Subscription depth, propagated to the stream (not used internally).
    pub depth: u32,
    /// Maximum distance (in ticks) from the best price for a candidate.
    pub distance_ticks: u32,
    /// Minimum size / v_ref ratio for a candidate.
    pub k_ratio: f64,
    /// Alternative absolute-size trigger; 0 disables it.
    pub abs_qty_threshold: f64,
    /// Required persistence before confirmation.
    pub dwell_seconds: f64,
    pub reposition_window_seconds: f64,
    pub reposition_ticks: u32,
    pub reposition_similar_pct: f64,
    pub reposition_max: u32,
    /// Trailing tape window retained for absorption math.
    pub trades_window_seconds: f64,
    /// Minimum executed volume at the wall price for confirmation.
    pub e_min: f64,
    /// Minimum absorption score (executed / size) for confirmation.
    pub a_min: f64,
    pub cancel_share_max: f64,
    pub consuming_drop_pct: f64,
    pub consuming_window_seconds: f64,
    pub min_exec_confirm: f64,
    pub cooldown_confirmed_seconds: f64,
    pub cooldown_consuming_seconds: f64,
    /// Number of same-side top levels feeding the v_ref median.
    pub vref_levels: usize,
    /// When set, a detected teleport resets the reposition counter instead
    /// of incrementing it.
    pub teleport_reset: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            max_symbols: 10,
            depth: 20,
            distance_ticks: 10,
            k_ratio: 10.0,
            abs_qty_threshold: 0.0,
            dwell_seconds: 30.0,
            reposition_window_seconds: 3.0,
            reposition_ticks: 1,
            reposition_similar_pct: 0.2,
            reposition_max: 1,
            trades_window_seconds: 20.0,
            e_min: 200.0,
            a_min: 0.2,
            cancel_share_max: 0.7,
            consuming_drop_pct: 0.2,
            consuming_window_seconds: 8.0,
            min_exec_confirm: 50.0,
            cooldown_confirmed_seconds: 120.0,
            cooldown_consuming_seconds: 45.0,
            vref_levels: 10,
            teleport_reset: false,
        }
    }
}

// =============================================================================
// Per-instrument state
// =============================================================================

/// The wall currently tracked for one instrument (at most one at a time).
#[derive(Debug, Clone)]
pub struct ActiveWall {
    pub side: Side,
    pub price: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub last_size: f64,
    pub distance_ticks: u32,
    pub ratio_to_median: f64,
    pub reposition_count: u32,
    pub confirmed_ts: Option<DateTime<Utc>>,
    pub consuming_ts: Option<DateTime<Utc>>,
    pub last_confirm_alert_ts: Option<DateTime<Utc>>,
    pub last_consuming_alert_ts: Option<DateTime<Utc>>,
    /// Bounded `(ts, size)` trail used for the consumption baseline.
    pub size_history: VecDeque<(DateTime<Utc>, f64)>,
    /// Size carried by the previous lifecycle event for this wall.
    pub last_event_qty: Option<f64>,
    /// Lifecycle session tag (one per candidate → … → lost span).
    pub session: Uuid,
}

impl ActiveWall {
    fn new(candidate: &WallCandidate, ts: DateTime<Utc>, reposition_count: u32) -> Self {
        Self {
            side: candidate.side,
            price: candidate.price,
            first_seen: ts,
            last_seen: ts,
            last_size: candidate.size,
            distance_ticks: candidate.distance_ticks,
            ratio_to_median: candidate.ratio,
            reposition_count,
            confirmed_ts: None,
            consuming_ts: None,
            last_confirm_alert_ts: None,
            last_consuming_alert_ts: None,
            size_history: VecDeque::new(),
            last_event_qty: None,
            session: Uuid::new_v4(),
        }
    }
}

/// Detector-owned state for one subscribed instrument.
#[derive(Debug, Clone)]
pub struct InstrumentState {
    pub instrument_id: String,
    pub tick_size: f64,
    pub symbol: String,
    pub last_snapshot: Option<OrderBookSnapshot>,
    pub trades: VecDeque<Trade>,
    pub active_wall: Option<ActiveWall>,
    last_debug_ts: Option<DateTime<Utc>>,
    last_debug_candidate_size: Option<f64>,
}

// =============================================================================
// Debug payload
// =============================================================================

/// Throttled per-snapshot diagnostics emitted by the debug variant.
#[derive(Debug, Clone, Serialize)]
pub struct WallDebug {
    pub symbol: String,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub spread: Option<f64>,
    pub candidate_side: Option<Side>,
    pub candidate_price: Option<f64>,
    pub candidate_qty: Option<f64>,
    pub candidate_distance_ticks_to_spread: Option<u32>,
    pub qty_ratio_to_median: Option<f64>,
    pub dwell_seconds: f64,
    pub qty_change_last_interval: f64,
    pub teleport_detected: bool,
    pub state: &'static str,
}

// =============================================================================
// Detector
// =============================================================================

/// Stateful wall detector. Owns the per-instrument state machines; must only
/// be driven from a single task (it is not re-entrant).
pub struct WallDetector {
    config: DetectorConfig,
    states: HashMap<String, InstrumentState>,
}

impl WallDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            states: HashMap::new(),
        }
    }

    /// Register an instrument. Idempotent: an already-known id is left
    /// untouched.
    pub fn upsert_instrument(&mut self, instrument_id: &str, tick_size: f64, symbol: &str) {
        self.states
            .entry(instrument_id.to_string())
            .or_insert_with(|| InstrumentState {
                instrument_id: instrument_id.to_string(),
                tick_size,
                symbol: symbol.to_string(),
                last_snapshot: None,
                trades: VecDeque::new(),
                active_wall: None,
                last_debug_ts: None,
                last_debug_candidate_size: None,
            });
    }

    /// Drop all state for an instrument.
    pub fn remove_instrument(&mut self, instrument_id: &str) {
        self.states.remove(instrument_id);
    }

    /// Append a tape trade to the rolling window, trimming entries older
    /// than `trades_window_seconds` relative to the trade timestamp.
    pub fn on_trade(&mut self, trade: Trade) {
        let window = self.config.trades_window_seconds;
        if let Some(state) = self.states.get_mut(&trade.instrument_id) {
            let ts = trade.ts;
            state.trades.push_back(trade);
            cleanup_trades(state, ts, window);
        }
    }

    /// Process a snapshot and return the alerts it produced.
    pub fn on_order_book(&mut self, snapshot: &OrderBookSnapshot) -> Vec<Alert> {
        self.process(snapshot, None).0
    }

    /// Process a snapshot and return alerts plus lifecycle events.
    pub fn on_order_book_with_events(
        &mut self,
        snapshot: &OrderBookSnapshot,
    ) -> (Vec<Alert>, Vec<WallEvent>) {
        let (alerts, events, _) = self.process(snapshot, None);
        (alerts, events)
    }

    /// Process a snapshot and additionally produce a throttled debug payload.
    pub fn on_order_book_with_debug(
        &mut self,
        snapshot: &OrderBookSnapshot,
        debug_interval: f64,
    ) -> (Vec<Alert>, Vec<WallEvent>, Option<WallDebug>) {
        self.process(snapshot, Some(debug_interval))
    }

    fn process(
        &mut self,
        snapshot: &OrderBookSnapshot,
        debug_interval: Option<f64>,
    ) -> (Vec<Alert>, Vec<WallEvent>, Option<WallDebug>) {
        let cfg = self.config;
        let Some(state) = self.states.get_mut(&snapshot.instrument_id) else {
            return (Vec::new(), Vec::new(), None);
        };
        state.last_snapshot = Some(snapshot.clone());
        cleanup_trades(state, snapshot.ts, cfg.trades_window_seconds);

        let instrument_id = state.instrument_id.clone();
        let symbol = state.symbol.clone();
        let tick_size = state.tick_size;

        let mut alerts: Vec<Alert> = Vec::new();
        let mut events: Vec<WallEvent> = Vec::new();

        let candidate = find_candidate(&cfg, snapshot, tick_size);

        let Some(candidate) = candidate else {
            if let Some(mut wall) = state.active_wall.take() {
                let reason = resolve_lost_reason(snapshot, &wall);
                let dwell = seconds_between(wall.first_seen, snapshot.ts);
                let qty = wall.last_size;
                events.push(build_wall_event(
                    &instrument_id,
                    &symbol,
                    tick_size,
                    snapshot,
                    &mut wall,
                    qty,
                    dwell,
                    WallEventKind::Lost,
                    Some(reason),
                    None,
                ));
            }
            let payload = build_debug(&cfg, state, snapshot, None, false, 0.0, debug_interval);
            return (alerts, events, payload);
        };

        let same_wall = matches!(
            &state.active_wall,
            Some(wall) if wall.side == candidate.side && wall.price == candidate.price
        );
        let mut teleport_detected = false;

        if !same_wall {
            let previous = state.active_wall.take();
            let mut reposition_count = 0u32;
            if let Some(prev) = &previous {
                let within_window = seconds_between(prev.last_seen, snapshot.ts)
                    <= cfg.reposition_window_seconds;
                if within_window {
                    let price_delta = (candidate.price - prev.price).abs();
                    let max_delta = cfg.reposition_ticks as f64 * tick_size;
                    let size_similarity =
                        (candidate.size - prev.last_size).abs() / prev.last_size.max(EPS);
                    if price_delta <= max_delta && size_similarity <= cfg.reposition_similar_pct {
                        teleport_detected = true;
                        reposition_count = if cfg.teleport_reset {
                            0
                        } else {
                            prev.reposition_count + 1
                        };
                    }
                }
            }
            if let Some(mut prev) = previous {
                let reason = if teleport_detected {
                    WallLostReason::Teleport
                } else {
                    resolve_lost_reason(snapshot, &prev)
                };
                let dwell = seconds_between(prev.first_seen, snapshot.ts);
                let qty = prev.last_size;
                events.push(build_wall_event(
                    &instrument_id,
                    &symbol,
                    tick_size,
                    snapshot,
                    &mut prev,
                    qty,
                    dwell,
                    WallEventKind::Lost,
                    Some(reason),
                    None,
                ));
            }
            let mut wall = ActiveWall::new(&candidate, snapshot.ts, reposition_count);
            events.push(build_wall_event(
                &instrument_id,
                &symbol,
                tick_size,
                snapshot,
                &mut wall,
                candidate.size,
                0.0,
                WallEventKind::Candidate,
                None,
                Some(threshold_snapshot(&cfg)),
            ));
            state.active_wall = Some(wall);
        }

        let executed_at_wall = executed_volume_at_price(&state.trades, candidate.price);
        let wall = state.active_wall.as_mut().expect("active wall just set");
        wall.distance_ticks = candidate.distance_ticks;
        wall.ratio_to_median = candidate.ratio;

        let previous_size = wall.last_size;
        wall.size_history.push_back((snapshot.ts, candidate.size));
        while wall.size_history.len() > SIZE_HISTORY_CAP {
            wall.size_history.pop_front();
        }
        wall.last_size = candidate.size;
        wall.last_seen = snapshot.ts;

        let dwell_seconds = seconds_between(wall.first_seen, snapshot.ts);
        let size_drop = (previous_size - candidate.size).max(0.0);
        let cancel_share = cancel_share(executed_at_wall, size_drop);
        let absorption_score = executed_at_wall / candidate.size.max(EPS);

        if should_confirm(
            &cfg,
            wall,
            dwell_seconds,
            executed_at_wall,
            cancel_share,
            absorption_score,
            size_drop,
            snapshot.ts,
        ) {
            if wall.confirmed_ts.is_none() {
                events.push(build_wall_event(
                    &instrument_id,
                    &symbol,
                    tick_size,
                    snapshot,
                    wall,
                    candidate.size,
                    dwell_seconds,
                    WallEventKind::Confirmed,
                    None,
                    None,
                ));
            }
            alerts.push(build_alert(
                snapshot,
                &candidate,
                AlertKind::Confirmed,
                dwell_seconds,
                executed_at_wall,
                cancel_share,
                vec![
                    format!("dwell>={}", cfg.dwell_seconds),
                    format!("ratio>={} or abs>={}", cfg.k_ratio, cfg.abs_qty_threshold),
                ],
            ));
            wall.confirmed_ts = Some(snapshot.ts);
            wall.last_confirm_alert_ts = Some(snapshot.ts);
        }

        if should_consume(&cfg, wall, snapshot.ts, executed_at_wall, cancel_share) {
            if wall.consuming_ts.is_none() {
                events.push(build_wall_event(
                    &instrument_id,
                    &symbol,
                    tick_size,
                    snapshot,
                    wall,
                    candidate.size,
                    dwell_seconds,
                    WallEventKind::Consuming,
                    None,
                    None,
                ));
                wall.consuming_ts = Some(snapshot.ts);
            }
            alerts.push(build_alert(
                snapshot,
                &candidate,
                AlertKind::Consuming,
                dwell_seconds,
                executed_at_wall,
                cancel_share,
                vec![
                    format!("drop>={:.2}", cfg.consuming_drop_pct),
                    format!("exec>={}", cfg.min_exec_confirm),
                ],
            ));
            wall.last_consuming_alert_ts = Some(snapshot.ts);
        }

        debug!(
            symbol = %symbol,
            candidate_price = candidate.price,
            candidate_size = candidate.size,
            executed_at_wall,
            cancel_share,
            "wall snapshot processed"
        );

        let payload = build_debug(
            &cfg,
            state,
            snapshot,
            Some(&candidate),
            teleport_detected,
            dwell_seconds,
            debug_interval,
        );
        (alerts, events, payload)
    }
}

// =============================================================================
// Candidate selection
// =============================================================================

fn find_candidate(
    cfg: &DetectorConfig,
    snapshot: &OrderBookSnapshot,
    tick_size: f64,
) -> Option<WallCandidate> {
    if tick_size <= 0.0 {
        return None;
    }
    let mut candidates: Vec<WallCandidate> = Vec::new();
    if let Some(best_bid) = snapshot.best_bid {
        find_side_candidates(cfg, Side::Buy, &snapshot.bids, best_bid, tick_size, &mut candidates);
    }
    if let Some(best_ask) = snapshot.best_ask {
        find_side_candidates(cfg, Side::Sell, &snapshot.asks, best_ask, tick_size, &mut candidates);
    }
    // Highest ratio across both sides wins; the earliest qualifying level
    // keeps the slot on ties.
    candidates.into_iter().fold(None, |best, item| match best {
        Some(prev) if prev.ratio >= item.ratio => Some(prev),
        _ => Some(item),
    })
}

fn find_side_candidates(
    cfg: &DetectorConfig,
    side: Side,
    levels: &[crate::types::OrderBookLevel],
    best_price: f64,
    tick_size: f64,
    out: &mut Vec<WallCandidate>,
) {
    if levels.is_empty() {
        return;
    }
    let top = &levels[..cfg.vref_levels.min(levels.len())];
    let v_ref = median_volume(top);
    for level in levels {
        let dist = ((level.price - best_price).abs() / tick_size).round();
        if !dist.is_finite() || dist < 1.0 || dist > cfg.distance_ticks as f64 {
            continue;
        }
        let ratio = level.quantity / v_ref.max(EPS);
        let abs_hit = cfg.abs_qty_threshold > 0.0 && level.quantity >= cfg.abs_qty_threshold;
        if ratio >= cfg.k_ratio || abs_hit {
            out.push(WallCandidate {
                side,
                price: level.price,
                size: level.quantity,
                ratio,
                v_ref,
                distance_ticks: dist as u32,
            });
        }
    }
}

/// Median of the non-zero level quantities; 0 when every quantity is zero.
fn median_volume(levels: &[crate::types::OrderBookLevel]) -> f64 {
    let mut values: Vec<f64> = levels
        .iter()
        .map(|level| level.quantity)
        .filter(|qty| *qty > 0.0)
        .collect();
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        values[mid]
    } else {
        (values[mid - 1] + values[mid]) / 2.0
    }
}

// =============================================================================
// Lifecycle helpers
// =============================================================================

/// Teleports are attributed at replacement time; here the wall either shrank
/// in place (cancel) or left the book entirely (disappear).
fn resolve_lost_reason(snapshot: &OrderBookSnapshot, wall: &ActiveWall) -> WallLostReason {
    match find_level_quantity(snapshot, wall.side, wall.price) {
        Some(_) => WallLostReason::Cancel,
        None => WallLostReason::Disappear,
    }
}

fn find_level_quantity(snapshot: &OrderBookSnapshot, side: Side, price: f64) -> Option<f64> {
    let levels = match side {
        Side::Buy => &snapshot.bids,
        Side::Sell => &snapshot.asks,
    };
    levels
        .iter()
        .find(|level| level.price == price)
        .map(|level| level.quantity)
}

fn cleanup_trades(state: &mut InstrumentState, ts: DateTime<Utc>, window_seconds: f64) {
    while let Some(front) = state.trades.front() {
        if seconds_between(front.ts, ts) > window_seconds {
            state.trades.pop_front();
        } else {
            break;
        }
    }
}

fn executed_volume_at_price(trades: &VecDeque<Trade>, price: f64) -> f64 {
    trades
        .iter()
        .filter(|trade| trade.price == price)
        .map(|trade| trade.quantity)
        .sum()
}

/// Share of the observed size drop not explained by executions. When
/// executions exceed the drop the share clamps to 0 — the whole drop is
/// attributed to trading, never a negative cancel share.
fn cancel_share(executed_at_wall: f64, size_drop: f64) -> f64 {
    if size_drop <= 0.0 {
        return 0.0;
    }
    1.0 - executed_at_wall.min(size_drop) / size_drop.max(EPS)
}

#[allow(clippy::too_many_arguments)]
fn should_confirm(
    cfg: &DetectorConfig,
    wall: &ActiveWall,
    dwell_seconds: f64,
    executed_at_wall: f64,
    cancel_share: f64,
    absorption_score: f64,
    size_drop: f64,
    ts: DateTime<Utc>,
) -> bool {
    if wall.reposition_count > cfg.reposition_max {
        return false;
    }
    if dwell_seconds < cfg.dwell_seconds {
        return false;
    }
    let has_cancel_signal = size_drop > 0.0 && cancel_share <= cfg.cancel_share_max;
    if !(executed_at_wall >= cfg.e_min || has_cancel_signal || absorption_score >= cfg.a_min) {
        return false;
    }
    match wall.last_confirm_alert_ts {
        None => true,
        Some(last) => seconds_between(last, ts) >= cfg.cooldown_confirmed_seconds,
    }
}

fn should_consume(
    cfg: &DetectorConfig,
    wall: &ActiveWall,
    ts: DateTime<Utc>,
    executed_at_wall: f64,
    cancel_share: f64,
) -> bool {
    if wall.confirmed_ts.is_none() {
        return false;
    }
    if executed_at_wall < cfg.min_exec_confirm && cancel_share > cfg.cancel_share_max {
        return false;
    }
    if consuming_drop_pct(cfg, wall, ts) < cfg.consuming_drop_pct {
        return false;
    }
    match wall.last_consuming_alert_ts {
        None => true,
        Some(last) => seconds_between(last, ts) >= cfg.cooldown_consuming_seconds,
    }
}

/// Drop of the current size against the earliest history point inside the
/// consuming window; 0 when no baseline is available.
fn consuming_drop_pct(cfg: &DetectorConfig, wall: &ActiveWall, ts: DateTime<Utc>) -> f64 {
    let baseline = wall
        .size_history
        .iter()
        .find(|(point_ts, _)| seconds_between(*point_ts, ts) <= cfg.consuming_window_seconds)
        .map(|(_, size)| *size);
    match baseline {
        Some(baseline) if baseline > 0.0 => ((baseline - wall.last_size) / baseline).max(0.0),
        _ => 0.0,
    }
}

fn distance_ticks_to_spread(
    snapshot: &OrderBookSnapshot,
    side: Side,
    price: f64,
    tick_size: f64,
) -> Option<u32> {
    let reference = match side {
        Side::Buy => snapshot.best_ask,
        Side::Sell => snapshot.best_bid,
    }?;
    if tick_size <= 0.0 {
        return None;
    }
    Some(((reference - price).abs() / tick_size).round() as u32)
}

fn threshold_snapshot(cfg: &DetectorConfig) -> ThresholdSnapshot {
    ThresholdSnapshot {
        k_ratio: cfg.k_ratio,
        abs_qty_threshold: cfg.abs_qty_threshold,
        distance_ticks: cfg.distance_ticks,
        dwell_seconds: cfg.dwell_seconds,
        e_min: cfg.e_min,
        a_min: cfg.a_min,
        cancel_share_max: cfg.cancel_share_max,
        consuming_drop_pct: cfg.consuming_drop_pct,
    }
}

#[allow(clippy::too_many_arguments)]
fn build_wall_event(
    instrument_id: &str,
    symbol: &str,
    tick_size: f64,
    snapshot: &OrderBookSnapshot,
    wall: &mut ActiveWall,
    qty: f64,
    dwell_seconds: f64,
    kind: WallEventKind,
    reason: Option<WallLostReason>,
    thresholds: Option<ThresholdSnapshot>,
) -> WallEvent {
    let qty_change = qty - wall.last_event_qty.unwrap_or(qty);
    wall.last_event_qty = Some(qty);
    WallEvent {
        kind,
        symbol: symbol.to_string(),
        side: wall.side,
        price: wall.price,
        qty,
        wall_key: format!("{}|{}|{}", instrument_id, wall.side, wall.price),
        distance_ticks: wall.distance_ticks,
        distance_ticks_to_spread: distance_ticks_to_spread(
            snapshot, wall.side, wall.price, tick_size,
        ),
        ratio_to_median: wall.ratio_to_median,
        dwell_seconds,
        qty_change_last_interval: qty_change,
        reason,
        thresholds,
        session: wall.session,
        ts: snapshot.ts,
    }
}

fn build_alert(
    snapshot: &OrderBookSnapshot,
    candidate: &WallCandidate,
    kind: AlertKind,
    dwell_seconds: f64,
    executed_at_wall: f64,
    cancel_share: f64,
    reasons: Vec<String>,
) -> Alert {
    Alert {
        instrument_id: snapshot.instrument_id.clone(),
        side: candidate.side,
        price: candidate.price,
        kind,
        size: candidate.size,
        ratio: candidate.ratio,
        v_ref: candidate.v_ref,
        distance_ticks: candidate.distance_ticks,
        dwell_seconds,
        executed_at_wall,
        cancel_share,
        reasons,
        ts: snapshot.ts,
    }
}

fn build_debug(
    cfg: &DetectorConfig,
    state: &mut InstrumentState,
    snapshot: &OrderBookSnapshot,
    candidate: Option<&WallCandidate>,
    teleport_detected: bool,
    dwell_seconds: f64,
    debug_interval: Option<f64>,
) -> Option<WallDebug> {
    let interval = debug_interval?.max(0.0);
    if let Some(last) = state.last_debug_ts {
        if seconds_between(last, snapshot.ts) < interval {
            return None;
        }
    }
    state.last_debug_ts = Some(snapshot.ts);

    let spread = match (snapshot.best_bid, snapshot.best_ask) {
        (Some(bid), Some(ask)) => Some(ask - bid),
        _ => None,
    };
    let candidate_distance = candidate.and_then(|c| {
        distance_ticks_to_spread(snapshot, c.side, c.price, state.tick_size)
    });

    let qty_change_last_interval = match candidate {
        Some(c) => {
            let change = state
                .last_debug_candidate_size
                .map(|last| c.size - last)
                .unwrap_or(0.0);
            state.last_debug_candidate_size = Some(c.size);
            change
        }
        None => {
            state.last_debug_candidate_size = None;
            0.0
        }
    };

    let debug_state = match (candidate, &state.active_wall) {
        (Some(_), Some(wall)) => {
            if wall.confirmed_ts.is_some() {
                if consuming_drop_pct(cfg, wall, snapshot.ts) >= cfg.consuming_drop_pct {
                    "CONSUMING"
                } else {
                    "CONFIRMED"
                }
            } else {
                "CANDIDATE"
            }
        }
        _ => "NONE",
    };

    Some(WallDebug {
        symbol: state.symbol.clone(),
        best_bid: snapshot.best_bid,
        best_ask: snapshot.best_ask,
        spread,
        candidate_side: candidate.map(|c| c.side),
        candidate_price: candidate.map(|c| c.price),
        candidate_qty: candidate.map(|c| c.size),
        candidate_distance_ticks_to_spread: candidate_distance,
        qty_ratio_to_median: candidate.map(|c| c.ratio),
        dwell_seconds: (dwell_seconds * 1000.0).round() / 1000.0,
        qty_change_last_interval,
        teleport_detected,
        state: debug_state,
    })
}
