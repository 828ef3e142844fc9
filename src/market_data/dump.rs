// =============================================================================
// Order-Book Dump — periodic REST book snapshots for operators
// =============================================================================
//
// Runs as a background Tokio task, fetching every instrument's book on a
// fixed interval and logging the top levels. Purely observational; the
// detector never sees these snapshots.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::Duration;
use tracing::{info, warn};

use crate::market_data::client::MarketDataApi;
use crate::market_data::resolver::InstrumentInfo;
use crate::types::OrderBookLevel;

/// Number of levels per side included in the dump line.
const DUMP_LEVELS: usize = 5;

fn format_levels(levels: &[OrderBookLevel]) -> String {
    levels
        .iter()
        .take(DUMP_LEVELS)
        .map(|level| format!("{}x{}", level.price, level.quantity))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Fetch and log each instrument's book every `interval_seconds` until the
/// stop signal fires. Requests are paced by the interval, never faster.
pub async fn run_orderbook_dump(
    client: Arc<dyn MarketDataApi>,
    instruments: Vec<InstrumentInfo>,
    depth: u32,
    interval_seconds: f64,
    mut stop: watch::Receiver<bool>,
) {
    let period = Duration::from_secs_f64(interval_seconds.max(0.01));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick of a tokio interval fires immediately; consume it so
    // the first dump waits one full period like every later one.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    return;
                }
                continue;
            }
        }
        for info in &instruments {
            if *stop.borrow() {
                return;
            }
            match client.get_order_book(&info.instrument_id, depth).await {
                Ok(snapshot) => {
                    info!(
                        symbol = %info.symbol,
                        best_bid = ?snapshot.best_bid,
                        best_ask = ?snapshot.best_ask,
                        bids = %format_levels(&snapshot.bids),
                        asks = %format_levels(&snapshot.asks),
                        "orderbook_dump"
                    );
                }
                Err(error) => {
                    warn!(symbol = %info.symbol, error = %error, "orderbook_dump_failed");
                }
            }
        }
    }
}
