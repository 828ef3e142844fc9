// =============================================================================
// Instrument Resolver — symbol → instrument lookup and tick size
// =============================================================================
//
// Symbols arrive as free-form queries (ticker, ISIN, FIGI, or a raw UID).
// The resolver classifies the query, asks the instruments service for
// matches, picks the best candidate (tradable instruments first, then by
// instrument-kind rank), and fetches the full record for the price step.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::InstrumentStatus;

/// Tick size fallback when the service reports a non-positive increment.
const DEFAULT_TICK_SIZE: f64 = 0.01;

// =============================================================================
// Wire records
// =============================================================================

/// Instrument category, ranked for resolution tie-breaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentKind {
    Share,
    Etf,
    Bond,
    Currency,
    Futures,
    Option,
    Other,
}

impl InstrumentKind {
    /// Unknown wire values map to `Other` so a new category cannot break
    /// resolution.
    pub fn from_wire(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "share" => Self::Share,
            "etf" => Self::Etf,
            "bond" => Self::Bond,
            "currency" => Self::Currency,
            "futures" => Self::Futures,
            "option" => Self::Option,
            _ => Self::Other,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Share => 0,
            Self::Etf => 1,
            Self::Bond => 2,
            Self::Currency => 3,
            Self::Futures => 4,
            Self::Option => 5,
            Self::Other => 6,
        }
    }
}

impl<'de> serde::Deserialize<'de> for InstrumentKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Ok(Self::from_wire(&value))
    }
}

fn default_kind() -> InstrumentKind {
    InstrumentKind::Other
}

/// Search hit returned by the find-instrument call.
#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentShort {
    pub uid: String,
    #[serde(default)]
    pub figi: Option<String>,
    #[serde(default)]
    pub isin: Option<String>,
    #[serde(default)]
    pub ticker: Option<String>,
    #[serde(default = "default_kind")]
    pub instrument_kind: InstrumentKind,
    #[serde(default)]
    pub api_trade_available_flag: bool,
}

/// Fixed-point price as `units + nano·10⁻⁹`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Quotation {
    pub units: i64,
    pub nano: i32,
}

impl Quotation {
    pub fn to_f64(self) -> f64 {
        self.units as f64 + self.nano as f64 * 1e-9
    }
}

/// Full instrument record fetched by id.
#[derive(Debug, Clone, Deserialize)]
pub struct FullInstrument {
    pub uid: String,
    #[serde(default)]
    pub min_price_increment: Option<Quotation>,
}

/// A resolved, streamable instrument.
#[derive(Debug, Clone)]
pub struct InstrumentInfo {
    pub instrument_id: String,
    pub symbol: String,
    pub tick_size: f64,
    pub kind: InstrumentKind,
    pub ticker: Option<String>,
    pub isin: Option<String>,
}

/// Id namespace accepted by the get-by-id call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdType {
    Uid,
    Figi,
}

impl IdType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uid => "UID",
            Self::Figi => "FIGI",
        }
    }
}

// =============================================================================
// Query classification and selection
// =============================================================================

pub fn is_uid_query(query: &str) -> bool {
    query.len() == 36
        && query
            .chars()
            .all(|c| c.is_ascii_hexdigit() || c == '-')
}

pub fn is_figi_query(query: &str) -> bool {
    query.is_ascii()
        && query.len() == 12
        && query.starts_with("BBG")
        && query[3..]
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

pub fn is_isin_query(query: &str) -> bool {
    query.is_ascii()
        && query.len() == 12
        && query[..2].chars().all(|c| c.is_ascii_uppercase())
        && query[2..]
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

/// Pick the best candidate for a query: match on the field the query shape
/// names (isin falls back to figi, then uid), prefer tradable instruments,
/// then the lowest instrument-kind rank. Earlier hits keep the slot on ties.
pub fn select_instrument<'a>(
    query: &str,
    candidates: &'a [InstrumentShort],
) -> Option<&'a InstrumentShort> {
    let matched: Vec<&InstrumentShort> = if is_uid_query(query) {
        candidates.iter().filter(|c| c.uid == query).collect()
    } else if is_figi_query(query) {
        candidates
            .iter()
            .filter(|c| c.figi.as_deref() == Some(query))
            .collect()
    } else if is_isin_query(query) {
        let by_isin: Vec<&InstrumentShort> = candidates
            .iter()
            .filter(|c| c.isin.as_deref() == Some(query))
            .collect();
        if !by_isin.is_empty() {
            by_isin
        } else {
            let by_figi: Vec<&InstrumentShort> = candidates
                .iter()
                .filter(|c| c.figi.as_deref() == Some(query))
                .collect();
            if !by_figi.is_empty() {
                by_figi
            } else {
                candidates.iter().filter(|c| c.uid == query).collect()
            }
        }
    } else {
        candidates
            .iter()
            .filter(|c| {
                c.ticker
                    .as_deref()
                    .is_some_and(|ticker| ticker.eq_ignore_ascii_case(query))
            })
            .collect()
    };

    matched.into_iter().fold(None, |best, item| match best {
        None => Some(item),
        Some(prev) => {
            let prev_key = (!prev.api_trade_available_flag, prev.instrument_kind.rank());
            let item_key = (!item.api_trade_available_flag, item.instrument_kind.rank());
            if item_key < prev_key {
                Some(item)
            } else {
                Some(prev)
            }
        }
    })
}

/// Convert the reported price increment; non-positive values fall back to
/// the default tick.
pub fn tick_size_from(increment: Option<Quotation>) -> f64 {
    match increment.map(Quotation::to_f64) {
        Some(value) if value > 0.0 => value,
        _ => DEFAULT_TICK_SIZE,
    }
}

// =============================================================================
// Instruments REST client
// =============================================================================

#[derive(Debug, Deserialize)]
struct FindInstrumentResponse {
    #[serde(default)]
    instruments: Vec<InstrumentShort>,
}

#[derive(Debug, Deserialize)]
struct GetInstrumentResponse {
    instrument: FullInstrument,
}

/// REST client for the instruments service.
pub struct InstrumentsClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    instrument_status: InstrumentStatus,
}

impl InstrumentsClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        token: impl Into<String>,
        instrument_status: InstrumentStatus,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            token: token.into(),
            instrument_status,
        }
    }

    /// POST /instruments/find.
    pub async fn find_instrument(&self, query: &str) -> Result<Vec<InstrumentShort>> {
        let url = format!("{}/instruments/find", self.base_url);
        let body = serde_json::json!({
            "query": query,
            "instrument_status": self.instrument_status.as_str(),
        });
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .context("find_instrument request failed")?
            .error_for_status()
            .context("find_instrument returned an error status")?
            .json::<FindInstrumentResponse>()
            .await
            .context("find_instrument response did not parse")?;
        Ok(response.instruments)
    }

    /// POST /instruments/get-by.
    pub async fn get_instrument_by(&self, id_type: IdType, id: &str) -> Result<FullInstrument> {
        let url = format!("{}/instruments/get-by", self.base_url);
        let body = serde_json::json!({
            "id_type": id_type.as_str(),
            "id": id,
        });
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .context("get_instrument_by request failed")?
            .error_for_status()
            .context("get_instrument_by returned an error status")?
            .json::<GetInstrumentResponse>()
            .await
            .context("get_instrument_by response did not parse")?;
        Ok(response.instrument)
    }

    /// Resolve one query into a streamable instrument, or `None` when the
    /// service has no match.
    pub async fn resolve_symbol(&self, query: &str) -> Result<Option<InstrumentInfo>> {
        let candidates = self.find_instrument(query).await?;
        let Some(selected) = select_instrument(query, &candidates) else {
            return Ok(None);
        };
        let full = self.get_instrument_by(IdType::Uid, &selected.uid).await?;
        Ok(Some(InstrumentInfo {
            instrument_id: full.uid,
            symbol: query.to_string(),
            tick_size: tick_size_from(full.min_price_increment),
            kind: selected.instrument_kind,
            ticker: selected.ticker.clone(),
            isin: selected.isin.clone(),
        }))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn short(
        uid: &str,
        ticker: Option<&str>,
        kind: InstrumentKind,
        tradable: bool,
    ) -> InstrumentShort {
        InstrumentShort {
            uid: uid.to_string(),
            figi: None,
            isin: None,
            ticker: ticker.map(str::to_string),
            instrument_kind: kind,
            api_trade_available_flag: tradable,
        }
    }

    #[test]
    fn query_classification() {
        assert!(is_uid_query("8e2b0325-0292-4654-8a18-4f63ed3b0e09"));
        assert!(!is_uid_query("SBER"));
        assert!(is_figi_query("BBG004730N88"));
        assert!(!is_figi_query("BBG00473"));
        assert!(is_isin_query("RU000A0JX0J2"));
        assert!(!is_isin_query("R0000A0JX0J2"));
        // FIGI shape is also ISIN-shaped; FIGI classification wins upstream.
        assert!(is_isin_query("BBG004730N88"));
    }

    #[test]
    fn select_prefers_tradable_then_kind_rank() {
        let candidates = vec![
            short("uid-bond", Some("SBER"), InstrumentKind::Bond, true),
            short("uid-share-off", Some("SBER"), InstrumentKind::Share, false),
            short("uid-share", Some("SBER"), InstrumentKind::Share, true),
            short("uid-etf", Some("SBER"), InstrumentKind::Etf, true),
        ];
        let selected = select_instrument("SBER", &candidates).expect("match");
        assert_eq!(selected.uid, "uid-share");
    }

    #[test]
    fn select_matches_ticker_case_insensitively() {
        let candidates = vec![short("uid-1", Some("SBER"), InstrumentKind::Share, true)];
        assert!(select_instrument("sber", &candidates).is_some());
        assert!(select_instrument("GAZP", &candidates).is_none());
    }

    #[test]
    fn select_by_uid_and_figi() {
        let uid = "8e2b0325-0292-4654-8a18-4f63ed3b0e09";
        let mut by_uid = short(uid, Some("SBER"), InstrumentKind::Share, true);
        by_uid.figi = Some("BBG004730N88".to_string());
        let candidates = vec![by_uid];
        assert!(select_instrument(uid, &candidates).is_some());
        assert!(select_instrument("BBG004730N88", &candidates).is_some());
    }

    #[test]
    fn isin_falls_back_to_figi_then_uid() {
        let mut candidate = short("RU000A0JX0J2", Some("BOND"), InstrumentKind::Bond, true);
        candidate.isin = None;
        candidate.figi = None;
        // No isin and no figi match; the uid field carries the query.
        let candidates = vec![candidate];
        let selected = select_instrument("RU000A0JX0J2", &candidates).expect("uid fallback");
        assert_eq!(selected.uid, "RU000A0JX0J2");

        let mut with_isin = short("uid-2", Some("BOND"), InstrumentKind::Bond, true);
        with_isin.isin = Some("RU000A0JX0J2".to_string());
        let candidates = vec![with_isin];
        assert!(select_instrument("RU000A0JX0J2", &candidates).is_some());
    }

    #[test]
    fn quotation_tick_size_conversion() {
        assert!(
            (tick_size_from(Some(Quotation { units: 0, nano: 10_000_000 })) - 0.01).abs() < 1e-12
        );
        assert!((tick_size_from(Some(Quotation { units: 2, nano: 500_000_000 })) - 2.5).abs()
            < 1e-9);
        // Non-positive increments fall back to the default tick.
        assert!((tick_size_from(Some(Quotation { units: 0, nano: 0 })) - 0.01).abs() < 1e-12);
        assert!((tick_size_from(None) - 0.01).abs() < 1e-12);
    }

    #[test]
    fn id_type_wire_names() {
        assert_eq!(IdType::Uid.as_str(), "UID");
        assert_eq!(IdType::Figi.as_str(), "FIGI");
    }

    #[test]
    fn instrument_kind_parses_from_wire() {
        let short: InstrumentShort = serde_json::from_str(
            r#"{ "uid": "uid-1", "ticker": "SBER", "instrument_kind": "share" }"#,
        )
        .unwrap();
        assert_eq!(short.instrument_kind, InstrumentKind::Share);
        let short: InstrumentShort = serde_json::from_str(
            r#"{ "uid": "uid-2", "instrument_kind": "warrant" }"#,
        )
        .unwrap();
        assert_eq!(short.instrument_kind, InstrumentKind::Other);
    }
}
