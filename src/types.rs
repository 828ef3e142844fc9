// =============================================================================
// Shared market-data and wall-lifecycle types used across WallWatch
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Order side as seen in the book or on the tape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// One aggregated price level of the book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderBookLevel {
    pub price: f64,
    pub quantity: f64,
}

/// A full depth snapshot for one instrument.
///
/// Invariants: `bids` are ordered best (highest) to worst, `asks` best
/// (lowest) to worst; when both best prices are present,
/// `best_bid < best_ask`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub instrument_id: String,
    pub bids: Vec<OrderBookLevel>,
    pub asks: Vec<OrderBookLevel>,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub ts: DateTime<Utc>,
}

/// A tape trade. `side` encodes the aggressor and may be absent when the
/// feed does not disclose direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub instrument_id: String,
    pub price: f64,
    pub quantity: f64,
    pub side: Option<Side>,
    pub ts: DateTime<Utc>,
}

/// A snapshot-level wall observation awaiting persistence.
#[derive(Debug, Clone, Copy)]
pub struct WallCandidate {
    pub side: Side,
    pub price: f64,
    pub size: f64,
    pub ratio: f64,
    pub v_ref: f64,
    pub distance_ticks: u32,
}

/// Alert kinds raised on confirm / consume transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AlertKind {
    #[serde(rename = "ALERT_WALL_CONFIRMED")]
    Confirmed,
    #[serde(rename = "ALERT_WALL_CONSUMING")]
    Consuming,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Confirmed => "ALERT_WALL_CONFIRMED",
            Self::Consuming => "ALERT_WALL_CONSUMING",
        }
    }
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detailed alert payload for downstream notification channels.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub instrument_id: String,
    pub side: Side,
    pub price: f64,
    pub kind: AlertKind,
    pub size: f64,
    pub ratio: f64,
    pub v_ref: f64,
    pub distance_ticks: u32,
    pub dwell_seconds: f64,
    pub executed_at_wall: f64,
    pub cancel_share: f64,
    pub reasons: Vec<String>,
    pub ts: DateTime<Utc>,
}

/// Wall lifecycle transition kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WallEventKind {
    #[serde(rename = "wall_candidate")]
    Candidate,
    #[serde(rename = "wall_confirmed")]
    Confirmed,
    #[serde(rename = "wall_consuming")]
    Consuming,
    #[serde(rename = "wall_lost")]
    Lost,
}

impl WallEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Candidate => "wall_candidate",
            Self::Confirmed => "wall_confirmed",
            Self::Consuming => "wall_consuming",
            Self::Lost => "wall_lost",
        }
    }

    /// Parse a config-file event name (e.g. `"wall_confirmed"`).
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "wall_candidate" => Some(Self::Candidate),
            "wall_confirmed" => Some(Self::Confirmed),
            "wall_consuming" => Some(Self::Consuming),
            "wall_lost" => Some(Self::Lost),
            _ => None,
        }
    }
}

impl std::fmt::Display for WallEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an active wall was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WallLostReason {
    Teleport,
    Cancel,
    Disappear,
}

impl WallLostReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Teleport => "teleport",
            Self::Cancel => "cancel",
            Self::Disappear => "disappear",
        }
    }
}

impl std::fmt::Display for WallLostReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The detector thresholds in effect when a candidate was raised.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ThresholdSnapshot {
    pub k_ratio: f64,
    pub abs_qty_threshold: f64,
    pub distance_ticks: u32,
    pub dwell_seconds: f64,
    pub e_min: f64,
    pub a_min: f64,
    pub cancel_share_max: f64,
    pub consuming_drop_pct: f64,
}

/// A wall lifecycle event emitted by the detector.
///
/// `wall_key` is the stable `{instrument_id}|{side}|{price}` triple used for
/// per-wall deduplication downstream; `session` tags one
/// candidate → … → lost lifecycle.
#[derive(Debug, Clone, Serialize)]
pub struct WallEvent {
    pub kind: WallEventKind,
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub qty: f64,
    pub wall_key: String,
    pub distance_ticks: u32,
    pub distance_ticks_to_spread: Option<u32>,
    pub ratio_to_median: f64,
    pub dwell_seconds: f64,
    pub qty_change_last_interval: f64,
    pub reason: Option<WallLostReason>,
    pub thresholds: Option<ThresholdSnapshot>,
    pub session: Uuid,
    pub ts: DateTime<Utc>,
}

/// Elapsed seconds from `earlier` to `later` (negative when reversed).
pub fn seconds_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    (later - earlier).num_milliseconds() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn side_display_and_serde() {
        assert_eq!(Side::Buy.to_string(), "BUY");
        assert_eq!(Side::Sell.to_string(), "SELL");
        assert_eq!(serde_json::to_string(&Side::Buy).unwrap(), "\"BUY\"");
        let side: Side = serde_json::from_str("\"SELL\"").unwrap();
        assert_eq!(side, Side::Sell);
    }

    #[test]
    fn event_kind_roundtrip() {
        for kind in [
            WallEventKind::Candidate,
            WallEventKind::Confirmed,
            WallEventKind::Consuming,
            WallEventKind::Lost,
        ] {
            assert_eq!(WallEventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(WallEventKind::parse("wall_unknown"), None);
    }

    #[test]
    fn seconds_between_subsecond_precision() {
        let a = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let b = a + chrono::Duration::milliseconds(2_500);
        assert!((seconds_between(a, b) - 2.5).abs() < 1e-9);
        assert!((seconds_between(b, a) + 2.5).abs() < 1e-9);
    }
}
