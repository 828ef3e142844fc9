// =============================================================================
// Telegram Notifier — outbound queue, cooldowns, per-wall dedup
// =============================================================================
//
// Lifecycle events pass three gates before they reach the wire: the
// `send_events` filter, the per-wall lifecycle sessions (a `wall_lost` goes
// out only after its `wall_confirmed`, and only once; `wall_consuming` only
// while confirmed; candidates bypass the sessions), and the per-`(symbol,
// kind)` cooldown. Admitted events are formatted once and queued; a single
// worker drains the queue and fans each payload out to every configured
// chat. Enqueue never blocks: a full queue drops the message with a
// `telegram_queue_full` log line.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::warn;

use crate::config::TelegramSection;
use crate::market_data::resolver::InstrumentInfo;
use crate::telegram::api::{BotApi, OutboundMessage};
use crate::telegram::format::{build_inline_keyboard, build_instrument_url, format_event_message};
use crate::types::{WallEvent, WallEventKind};

/// Outbound queue capacity.
const QUEUE_CAPACITY: usize = 1000;

/// Poll period while waiting for the queue to drain in `flush`.
const FLUSH_POLL_MILLIS: u64 = 10;

// =============================================================================
// Settings
// =============================================================================

#[derive(Debug, Clone)]
pub struct NotifierSettings {
    pub parse_mode: String,
    pub disable_web_preview: bool,
    pub send_events: HashSet<WallEventKind>,
    pub cooldown_seconds: HashMap<WallEventKind, f64>,
    pub include_instrument_button: bool,
    pub button_text: String,
    pub append_security_share_utm: bool,
}

impl NotifierSettings {
    /// Build from the config file section; unknown event names are dropped
    /// with a warning.
    pub fn from_config(section: &TelegramSection, parse_mode: &str) -> Self {
        let mut send_events = HashSet::new();
        for name in &section.send_events {
            match WallEventKind::parse(name) {
                Some(kind) => {
                    send_events.insert(kind);
                }
                None => warn!(event = %name, "telegram_unknown_send_event"),
            }
        }
        let mut cooldown_seconds = HashMap::new();
        for (name, seconds) in &section.cooldown_seconds {
            match WallEventKind::parse(name) {
                Some(kind) => {
                    cooldown_seconds.insert(kind, *seconds);
                }
                None => warn!(event = %name, "telegram_unknown_cooldown_event"),
            }
        }
        Self {
            parse_mode: parse_mode.to_string(),
            disable_web_preview: section.disable_web_preview,
            send_events,
            cooldown_seconds,
            include_instrument_button: section.include_instrument_button,
            button_text: section.button_text.clone(),
            append_security_share_utm: section.append_security_share_utm,
        }
    }
}

// =============================================================================
// Delivery gate
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WallSessionPhase {
    Confirmed,
    Lost,
}

/// The pure admission logic: send-events filter, lifecycle sessions, and
/// cooldowns. Session transitions commit only when the event is actually
/// admitted, so a cooldown-dropped message never consumes the lifecycle.
pub struct DeliveryGate {
    send_events: HashSet<WallEventKind>,
    cooldown_seconds: HashMap<WallEventKind, f64>,
    last_sent: HashMap<(String, WallEventKind), Instant>,
    sessions: HashMap<(String, String), WallSessionPhase>,
}

impl DeliveryGate {
    pub fn new(
        send_events: HashSet<WallEventKind>,
        cooldown_seconds: HashMap<WallEventKind, f64>,
    ) -> Self {
        Self {
            send_events,
            cooldown_seconds,
            last_sent: HashMap::new(),
            sessions: HashMap::new(),
        }
    }

    pub fn admit(&mut self, event: &WallEvent, now: Instant) -> bool {
        if !self.send_events.contains(&event.kind) {
            return false;
        }

        let session_key = (event.symbol.clone(), event.wall_key.clone());
        let phase = self.sessions.get(&session_key).copied();
        let lifecycle_ok = match event.kind {
            WallEventKind::Candidate | WallEventKind::Confirmed => true,
            WallEventKind::Consuming | WallEventKind::Lost => {
                phase == Some(WallSessionPhase::Confirmed)
            }
        };
        if !lifecycle_ok {
            return false;
        }

        let cooldown = self
            .cooldown_seconds
            .get(&event.kind)
            .copied()
            .unwrap_or(0.0);
        if cooldown > 0.0 {
            let cooldown_key = (event.symbol.clone(), event.kind);
            if let Some(last) = self.last_sent.get(&cooldown_key) {
                if now.duration_since(*last).as_secs_f64() < cooldown {
                    return false;
                }
            }
            self.last_sent.insert(cooldown_key, now);
        }

        match event.kind {
            WallEventKind::Confirmed => {
                self.sessions.insert(session_key, WallSessionPhase::Confirmed);
            }
            WallEventKind::Lost => {
                self.sessions.insert(session_key, WallSessionPhase::Lost);
            }
            WallEventKind::Candidate | WallEventKind::Consuming => {}
        }
        true
    }
}

// =============================================================================
// Notifier
// =============================================================================

/// One formatted payload awaiting delivery (fanned out per chat by the
/// worker).
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub text: String,
    pub reply_markup: Option<serde_json::Value>,
}

pub struct TelegramNotifier {
    settings: NotifierSettings,
    gate: Mutex<DeliveryGate>,
    instruments: RwLock<HashMap<String, InstrumentInfo>>,
    tx: mpsc::Sender<QueuedMessage>,
    pending: Arc<AtomicUsize>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TelegramNotifier {
    /// Build the notifier and spawn its delivery worker.
    pub fn new(settings: NotifierSettings, chat_ids: Vec<i64>, api: Arc<dyn BotApi>) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let pending = Arc::new(AtomicUsize::new(0));
        let gate = DeliveryGate::new(
            settings.send_events.clone(),
            settings.cooldown_seconds.clone(),
        );
        let worker = tokio::spawn(worker_loop(
            api,
            chat_ids,
            settings.parse_mode.clone(),
            settings.disable_web_preview,
            rx,
            pending.clone(),
        ));
        Self {
            settings,
            gate: Mutex::new(gate),
            instruments: RwLock::new(HashMap::new()),
            tx,
            pending,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Replace the symbol → instrument map for link building.
    pub fn update_instruments(&self, instruments: HashMap<String, InstrumentInfo>) {
        *self.instruments.write() = instruments;
    }

    /// Gate, format, and enqueue one lifecycle event. Never blocks.
    pub fn notify(&self, event: &WallEvent) {
        if !self.gate.lock().admit(event, Instant::now()) {
            return;
        }
        let message = self.build_message(event);
        match self.tx.try_send(message) {
            Ok(()) => {
                self.pending.fetch_add(1, Ordering::SeqCst);
            }
            Err(TrySendError::Full(_)) => warn!("telegram_queue_full"),
            Err(TrySendError::Closed(_)) => warn!("telegram_queue_closed"),
        }
    }

    fn build_message(&self, event: &WallEvent) -> QueuedMessage {
        let text = format_event_message(event);
        let reply_markup = if self.settings.include_instrument_button {
            let instruments = self.instruments.read();
            build_instrument_url(
                &event.symbol,
                instruments.get(&event.symbol),
                self.settings.append_security_share_utm,
            )
            .map(|url| build_inline_keyboard(&url, &self.settings.button_text))
        } else {
            None
        };
        QueuedMessage { text, reply_markup }
    }

    /// Wait until every queued payload has been handed to the transport.
    pub async fn flush(&self) {
        while self.pending.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(FLUSH_POLL_MILLIS)).await;
        }
    }

    /// Stop the delivery worker.
    pub fn close(&self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }
}

async fn worker_loop(
    api: Arc<dyn BotApi>,
    chat_ids: Vec<i64>,
    parse_mode: String,
    disable_web_preview: bool,
    mut rx: mpsc::Receiver<QueuedMessage>,
    pending: Arc<AtomicUsize>,
) {
    while let Some(message) = rx.recv().await {
        for chat_id in &chat_ids {
            let outbound = OutboundMessage {
                chat_id: *chat_id,
                text: message.text.clone(),
                parse_mode: Some(parse_mode.clone()),
                disable_web_preview,
                reply_markup: message.reply_markup.clone(),
            };
            // No in-band retry: the next event restarts delivery.
            if let Err(error) = api.send_message(outbound).await {
                warn!(error = %api.redact(&error.to_string()), "telegram_send_failed");
            }
        }
        pending.fetch_sub(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::api::{TelegramApiError, Update};
    use crate::types::Side;
    use async_trait::async_trait;
    use chrono::Utc;
    use uuid::Uuid;

    fn event(kind: WallEventKind) -> WallEvent {
        event_for(kind, "SBER", "uid-sber|BUY|120.5")
    }

    fn event_for(kind: WallEventKind, symbol: &str, wall_key: &str) -> WallEvent {
        WallEvent {
            kind,
            symbol: symbol.to_string(),
            side: Side::Buy,
            price: 120.5,
            qty: 1000.0,
            wall_key: wall_key.to_string(),
            distance_ticks: 2,
            distance_ticks_to_spread: Some(1),
            ratio_to_median: 12.3,
            dwell_seconds: 3.2,
            qty_change_last_interval: -50.0,
            reason: None,
            thresholds: None,
            session: Uuid::new_v4(),
            ts: Utc::now(),
        }
    }

    fn gate(kinds: &[WallEventKind]) -> DeliveryGate {
        DeliveryGate::new(kinds.iter().copied().collect(), HashMap::new())
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_suppresses_duplicates_per_symbol_and_kind() {
        let mut gate = DeliveryGate::new(
            [WallEventKind::Confirmed].into_iter().collect(),
            HashMap::from([(WallEventKind::Confirmed, 60.0)]),
        );

        assert!(gate.admit(&event(WallEventKind::Confirmed), Instant::now()));
        assert!(!gate.admit(&event(WallEventKind::Confirmed), Instant::now()));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(gate.admit(&event(WallEventKind::Confirmed), Instant::now()));
    }

    #[test]
    fn lost_sent_once_per_confirm() {
        let mut gate = gate(&[WallEventKind::Confirmed, WallEventKind::Lost]);
        let now = Instant::now();

        assert!(gate.admit(&event(WallEventKind::Confirmed), now));
        assert!(gate.admit(&event(WallEventKind::Lost), now));
        assert!(!gate.admit(&event(WallEventKind::Lost), now));

        // A fresh confirm re-opens the lifecycle.
        assert!(gate.admit(&event(WallEventKind::Confirmed), now));
        assert!(gate.admit(&event(WallEventKind::Lost), now));
    }

    #[test]
    fn lost_dedup_is_per_wall_key() {
        let mut gate = gate(&[WallEventKind::Confirmed, WallEventKind::Lost]);
        let now = Instant::now();

        assert!(gate.admit(
            &event_for(WallEventKind::Confirmed, "SBER", "uid-sber|BUY|120.5"),
            now
        ));
        assert!(gate.admit(
            &event_for(WallEventKind::Lost, "SBER", "uid-sber|BUY|120.5"),
            now
        ));
        // Same symbol, different wall key: its own lifecycle.
        assert!(gate.admit(
            &event_for(WallEventKind::Confirmed, "SBER", "uid-sber|BUY|121"),
            now
        ));
        assert!(gate.admit(
            &event_for(WallEventKind::Lost, "SBER", "uid-sber|BUY|121"),
            now
        ));
        // And a different symbol entirely.
        assert!(gate.admit(
            &event_for(WallEventKind::Confirmed, "GAZP", "uid-gazp|SELL|210"),
            now
        ));
        assert!(gate.admit(
            &event_for(WallEventKind::Lost, "GAZP", "uid-gazp|SELL|210"),
            now
        ));
    }

    #[test]
    fn lost_without_confirm_is_dropped() {
        let mut gate = gate(&[WallEventKind::Lost]);
        assert!(!gate.admit(&event(WallEventKind::Lost), Instant::now()));
    }

    #[test]
    fn consuming_requires_prior_confirm() {
        let mut gate = gate(&[WallEventKind::Confirmed, WallEventKind::Consuming]);
        let now = Instant::now();

        assert!(!gate.admit(&event(WallEventKind::Consuming), now));
        assert!(gate.admit(&event(WallEventKind::Confirmed), now));
        assert!(gate.admit(&event(WallEventKind::Consuming), now));
        // Still confirmed: consuming may repeat (cooldown-limited only).
        assert!(gate.admit(&event(WallEventKind::Consuming), now));
    }

    #[test]
    fn candidate_bypasses_lifecycle_sessions() {
        let mut gate = gate(&[WallEventKind::Candidate]);
        let now = Instant::now();
        assert!(gate.admit(&event(WallEventKind::Candidate), now));
        assert!(gate.admit(&event(WallEventKind::Candidate), now));
    }

    #[test]
    fn unlisted_events_are_dropped_silently() {
        let mut gate = gate(&[WallEventKind::Confirmed]);
        assert!(!gate.admit(&event(WallEventKind::Candidate), Instant::now()));
    }

    #[test]
    fn settings_from_config_drops_unknown_names() {
        let mut section = TelegramSection::default();
        section.send_events = vec![
            "wall_confirmed".to_string(),
            "wall_exploded".to_string(),
        ];
        let settings = NotifierSettings::from_config(&section, "HTML");
        assert_eq!(settings.send_events.len(), 1);
        assert!(settings.send_events.contains(&WallEventKind::Confirmed));
        assert_eq!(settings.parse_mode, "HTML");
    }

    struct RecordingApi {
        sent: Mutex<Vec<OutboundMessage>>,
    }

    #[async_trait]
    impl BotApi for RecordingApi {
        async fn get_updates(
            &self,
            _offset: Option<i64>,
            _timeout_seconds: u64,
        ) -> Result<Vec<Update>, TelegramApiError> {
            Ok(Vec::new())
        }

        async fn send_message(&self, message: OutboundMessage) -> Result<(), TelegramApiError> {
            self.sent.lock().push(message);
            Ok(())
        }

        fn redact(&self, text: &str) -> String {
            text.to_string()
        }
    }

    fn settings(kinds: &[WallEventKind]) -> NotifierSettings {
        NotifierSettings {
            parse_mode: "HTML".to_string(),
            disable_web_preview: true,
            send_events: kinds.iter().copied().collect(),
            cooldown_seconds: HashMap::new(),
            include_instrument_button: true,
            button_text: "Open in T-Invest".to_string(),
            append_security_share_utm: false,
        }
    }

    #[tokio::test]
    async fn notify_formats_and_delivers_to_every_chat() {
        let api = Arc::new(RecordingApi {
            sent: Mutex::new(Vec::new()),
        });
        let notifier = TelegramNotifier::new(
            settings(&[WallEventKind::Confirmed]),
            vec![1, 2],
            api.clone(),
        );

        notifier.notify(&event(WallEventKind::Confirmed));
        notifier.flush().await;
        notifier.close();

        let sent = api.sent.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].chat_id, 1);
        assert_eq!(sent[1].chat_id, 2);
        assert!(sent[0].text.contains("WALL CONFIRMED"));
        assert_eq!(sent[0].parse_mode.as_deref(), Some("HTML"));
        assert!(sent[0].disable_web_preview);
        let keyboard = sent[0].reply_markup.as_ref().expect("keyboard attached");
        assert!(keyboard["inline_keyboard"][0][0]["url"]
            .as_str()
            .unwrap()
            .ends_with("/SBER/"));
    }

    #[tokio::test]
    async fn gated_events_never_reach_the_queue() {
        let api = Arc::new(RecordingApi {
            sent: Mutex::new(Vec::new()),
        });
        let notifier = TelegramNotifier::new(
            settings(&[WallEventKind::Confirmed, WallEventKind::Lost]),
            vec![1],
            api.clone(),
        );

        notifier.notify(&event(WallEventKind::Lost));
        notifier.notify(&event(WallEventKind::Confirmed));
        notifier.notify(&event(WallEventKind::Lost));
        notifier.notify(&event(WallEventKind::Lost));
        notifier.flush().await;
        notifier.close();

        // Confirmed + exactly one lost.
        assert_eq!(api.sent.lock().len(), 2);
    }
}
