// =============================================================================
// Notifier — Outbound alert capability
// =============================================================================

use tracing::info;

use crate::types::Alert;

/// Alert delivery capability. The console implementation logs; the Telegram
/// pipeline handles lifecycle events separately with its own queue and
/// deduplication.
pub trait Notifier: Send + Sync {
    fn notify(&self, alert: &Alert);
}

/// Writes alerts to the structured log.
#[derive(Debug, Default)]
pub struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify(&self, alert: &Alert) {
        info!(
            event = alert.kind.as_str(),
            instrument = %alert.instrument_id,
            side = %alert.side,
            price = alert.price,
            size = alert.size,
            ratio = format!("{:.2}", alert.ratio),
            v_ref = format!("{:.2}", alert.v_ref),
            distance_ticks = alert.distance_ticks,
            dwell = format!("{:.1}s", alert.dwell_seconds),
            executed_at_wall = format!("{:.2}", alert.executed_at_wall),
            cancel_share = format!("{:.2}", alert.cancel_share),
            reasons = %alert.reasons.join(","),
            "alert"
        );
    }
}
