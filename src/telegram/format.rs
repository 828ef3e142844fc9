// =============================================================================
// Telegram Formatting — event messages, HTML escaping, instrument links
// =============================================================================

use crate::market_data::resolver::{InstrumentInfo, InstrumentKind};
use crate::types::{WallEvent, WallEventKind};

const INVEST_BASE_URL: &str = "https://www.tbank.ru/invest";

/// Query suffix appended to share links when configured.
const SECURITY_SHARE_UTM: &str = "?utm_source=security_share";

/// Title line per event kind.
pub fn event_title(kind: WallEventKind) -> &'static str {
    match kind {
        WallEventKind::Candidate => "🟨 WALL CANDIDATE",
        WallEventKind::Confirmed => "✅ WALL CONFIRMED",
        WallEventKind::Consuming => "🚨 WALL CONSUMING",
        WallEventKind::Lost => "⛔ WALL LOST",
    }
}

/// Escape user-controlled text for HTML parse mode.
pub fn html_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Render a float without trailing zeros (`120.500000` → `120.5`).
pub fn format_decimal(value: f64, digits: usize) -> String {
    let formatted = format!("{value:.digits$}");
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() || trimmed == "-" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Like [`format_decimal`] but with an explicit sign for non-negatives.
pub fn format_signed(value: f64, digits: usize) -> String {
    let formatted = format_decimal(value, digits);
    if formatted.starts_with('-') {
        formatted
    } else {
        format!("+{formatted}")
    }
}

/// Deep link to the instrument page, by instrument category. Without a
/// resolved instrument, ISIN-shaped symbols fall back to the bonds page and
/// everything else to the stocks page.
pub fn build_instrument_url(
    symbol: &str,
    instrument: Option<&InstrumentInfo>,
    append_security_share_utm: bool,
) -> Option<String> {
    let share_url = |ticker: &str| {
        let mut url = format!("{INVEST_BASE_URL}/stocks/{ticker}/");
        if append_security_share_utm {
            url.push_str(SECURITY_SHARE_UTM);
        }
        url
    };

    let Some(instrument) = instrument else {
        if crate::market_data::resolver::is_isin_query(symbol) {
            return Some(format!("{INVEST_BASE_URL}/bonds/{symbol}/"));
        }
        return Some(share_url(symbol));
    };

    match instrument.kind {
        InstrumentKind::Share => instrument.ticker.as_deref().map(share_url),
        InstrumentKind::Bond => instrument
            .isin
            .as_deref()
            .map(|isin| format!("{INVEST_BASE_URL}/bonds/{isin}/")),
        InstrumentKind::Etf => instrument.ticker.as_deref().map(|ticker| {
            format!(
                "{INVEST_BASE_URL}/etfs/{}/",
                urlencoding::encode(ticker)
            )
        }),
        InstrumentKind::Futures => instrument
            .ticker
            .as_deref()
            .map(|ticker| format!("{INVEST_BASE_URL}/futures/{ticker}/")),
        InstrumentKind::Currency => instrument
            .ticker
            .as_deref()
            .map(|ticker| format!("{INVEST_BASE_URL}/currencies/{ticker}/")),
        InstrumentKind::Option | InstrumentKind::Other => None,
    }
}

/// Single-button inline keyboard pointing at the instrument page.
pub fn build_inline_keyboard(url: &str, button_text: &str) -> serde_json::Value {
    serde_json::json!({
        "inline_keyboard": [[{ "text": button_text, "url": url }]]
    })
}

/// HTML message body for one lifecycle event.
pub fn format_event_message(event: &WallEvent) -> String {
    let distance = event
        .distance_ticks_to_spread
        .map(|ticks| ticks.to_string())
        .unwrap_or_else(|| "n/a".to_string());
    let mut lines = vec![
        format!("<b>{}</b>", html_escape(event_title(event.kind))),
        format!("<b>Symbol:</b> {}", html_escape(&event.symbol)),
        format!("<b>Side:</b> {}", html_escape(&event.side.to_string())),
        format!("<b>Price:</b> {}", format_decimal(event.price, 6)),
        format!("<b>Qty:</b> {}", format_decimal(event.qty, 6)),
        format!(
            "<b>Ratio to median:</b> {}",
            format_decimal(event.ratio_to_median, 2)
        ),
        format!("<b>Distance to spread:</b> {distance}"),
        format!("<b>Dwell:</b> {}s", format_decimal(event.dwell_seconds, 1)),
        format!(
            "<b>Qty change:</b> {}",
            format_signed(event.qty_change_last_interval, 2)
        ),
    ];
    if let Some(reason) = event.reason {
        lines.push(format!("<b>Reason:</b> {}", html_escape(reason.as_str())));
    }
    lines.join("\n")
}
