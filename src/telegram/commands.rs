// =============================================================================
// Telegram Commands — parsing and handlers for the inbound bot
// =============================================================================
//
// Commands mutate the subscription set through the manager's
// `SubscriptionControl` surface and report runtime-state snapshots. Every
// user-controlled substring that ends up in a reply is HTML-escaped.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::info;
use uuid::Uuid;

use crate::market_data::manager::SubscriptionControl;
use crate::runtime_state::{RuntimeState, RuntimeStateSnapshot, WallEventSummary};
use crate::telegram::format::{
    build_inline_keyboard, build_instrument_url, format_event_message, html_escape,
};
use crate::telegram::notifier::QueuedMessage;
use crate::types::{Side, WallEvent, WallEventKind};

/// A slash command with its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub name: String,
    pub args: Vec<String>,
}

/// Parse `"/watch SBER GAZP"` (also the `/cmd@botname` form). Non-commands
/// map to `None`.
pub fn parse_command(text: &str) -> Option<ParsedCommand> {
    let stripped = text.trim();
    if !stripped.starts_with('/') {
        return None;
    }
    let mut parts = stripped.split_whitespace();
    let head = parts.next()?;
    let mut name = &head[1..];
    if let Some(at) = name.find('@') {
        name = &name[..at];
    }
    if name.is_empty() {
        return None;
    }
    Some(ParsedCommand {
        name: name.to_lowercase(),
        args: parts.map(str::to_string).collect(),
    })
}

/// Split command arguments on whitespace and commas into a normalized,
/// deduplicated symbol list.
pub fn parse_symbols(args: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut symbols = Vec::new();
    for arg in args {
        for item in arg.split(',') {
            let cleaned = item.trim().to_uppercase();
            if !cleaned.is_empty() && seen.insert(cleaned.clone()) {
                symbols.push(cleaned);
            }
        }
    }
    symbols
}

pub fn format_uptime(started_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let total_minutes = (now - started_at).num_seconds().max(0) / 60;
    format!("{}h{}m", total_minutes / 60, total_minutes % 60)
}

fn format_code(text: &str) -> String {
    format!("<code>{}</code>", html_escape(text))
}

fn format_since_last(snapshot: &RuntimeStateSnapshot) -> String {
    match snapshot.since_last_message_seconds {
        None => "n/a".to_string(),
        Some(seconds) => format!("{seconds:.3}s"),
    }
}

pub fn format_ping_response(snapshot: &RuntimeStateSnapshot, now: DateTime<Utc>) -> String {
    format!(
        "pong {} uptime={} stream_state={} rx_total_orderbooks={} rx_total_trades={} since_last_message_seconds={}",
        html_escape(&now.to_rfc3339_opts(SecondsFormat::Secs, false)),
        html_escape(&format_uptime(snapshot.started_at, now)),
        html_escape(&snapshot.stream_state.to_string()),
        snapshot.rx_total_orderbooks,
        snapshot.rx_total_trades,
        html_escape(&format_since_last(snapshot)),
    )
}

fn format_last_wall_event(event: Option<&WallEventSummary>) -> String {
    match event {
        None => "none".to_string(),
        Some(event) => format!(
            "{} {} {} {} {} @ {}",
            html_escape(event.kind.as_str()),
            html_escape(&event.symbol),
            html_escape(&event.side.to_string()),
            event.price,
            event.qty,
            html_escape(&event.ts.to_rfc3339_opts(SecondsFormat::Secs, false)),
        ),
    }
}

pub fn format_status_response(snapshot: &RuntimeStateSnapshot) -> String {
    let symbols_text = if snapshot.current_symbols.is_empty() {
        "none".to_string()
    } else {
        snapshot.current_symbols.join(", ")
    };
    [
        format!("state={}", html_escape(&snapshot.stream_state.to_string())),
        format!("since_last_message={}", html_escape(&format_since_last(snapshot))),
        format!("rx_total_orderbooks={}", snapshot.rx_total_orderbooks),
        format!("rx_total_trades={}", snapshot.rx_total_trades),
        format!("symbols={}", html_escape(&symbols_text)),
        format!("depth={}", snapshot.depth),
        format!(
            "last_wall_event={}",
            format_last_wall_event(snapshot.last_wall_event.as_ref())
        ),
    ]
    .join("\n")
}

/// Reply to one inbound command: an optional plain reply plus zero or more
/// pre-formatted messages (used by `/smoke`).
#[derive(Debug, Default)]
pub struct CommandResponse {
    pub text: Option<String>,
    pub messages: Vec<QueuedMessage>,
}

impl CommandResponse {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            messages: Vec::new(),
        }
    }
}

pub struct TelegramCommandHandler {
    runtime_state: Arc<RuntimeState>,
    control: Arc<dyn SubscriptionControl>,
    max_symbols: usize,
    allowed_user_ids: HashSet<i64>,
    include_instrument_button: bool,
    button_text: String,
    append_security_share_utm: bool,
}

impl TelegramCommandHandler {
    pub fn new(
        runtime_state: Arc<RuntimeState>,
        control: Arc<dyn SubscriptionControl>,
        max_symbols: usize,
        allowed_user_ids: HashSet<i64>,
        include_instrument_button: bool,
        button_text: impl Into<String>,
        append_security_share_utm: bool,
    ) -> Self {
        Self {
            runtime_state,
            control,
            max_symbols,
            allowed_user_ids,
            include_instrument_button,
            button_text: button_text.into(),
            append_security_share_utm,
        }
    }

    /// Handle one inbound text. `None` means "not a command, stay silent".
    /// An empty allow-list disables authorization entirely.
    pub fn handle_command(
        &self,
        text: &str,
        chat_id: i64,
        user_id: Option<i64>,
    ) -> Option<CommandResponse> {
        let parsed = parse_command(text)?;
        if !self.allowed_user_ids.is_empty()
            && !user_id.is_some_and(|id| self.allowed_user_ids.contains(&id))
        {
            info!(
                chat_id,
                user_id = ?user_id,
                command = %parsed.name,
                "telegram_not_allowed"
            );
            return Some(CommandResponse::text("not allowed"));
        }
        let response = self.handle_allowed(&parsed);
        info!(
            chat_id,
            user_id = ?user_id,
            command = %parsed.name,
            "telegram_command_handled"
        );
        Some(response)
    }

    fn handle_allowed(&self, parsed: &ParsedCommand) -> CommandResponse {
        match parsed.name.as_str() {
            "start" | "help" => CommandResponse::text(self.help_text()),
            "ping" => {
                let snapshot = self.runtime_state.snapshot();
                CommandResponse::text(format_ping_response(&snapshot, Utc::now()))
            }
            "status" => {
                let snapshot = self.runtime_state.snapshot();
                CommandResponse::text(format_status_response(&snapshot))
            }
            "list" => {
                let symbols = self.control.get_symbols();
                let symbols_text = if symbols.is_empty() {
                    "none".to_string()
                } else {
                    symbols.join(", ")
                };
                CommandResponse::text(format!("symbols={}", html_escape(&symbols_text)))
            }
            "watch" => self.handle_watch(&parsed.args),
            "unwatch" => self.handle_unwatch(&parsed.args),
            "smoke" => CommandResponse {
                text: None,
                messages: vec![self.build_smoke_message()],
            },
            _ => CommandResponse::text("Unknown command. Use /help."),
        }
    }

    fn handle_watch(&self, args: &[String]) -> CommandResponse {
        let symbols = parse_symbols(args);
        if symbols.is_empty() {
            return CommandResponse::text(format!("Usage: {}", format_code("/watch <symbols>")));
        }
        if symbols.len() > self.max_symbols {
            return CommandResponse::text(format!(
                "Too many symbols (max {}).",
                self.max_symbols
            ));
        }
        self.control.update_symbols(symbols.clone());
        CommandResponse::text(format!("watching: {}", html_escape(&symbols.join(", "))))
    }

    fn handle_unwatch(&self, args: &[String]) -> CommandResponse {
        let symbols = parse_symbols(args);
        if symbols.is_empty() {
            return CommandResponse::text(format!("Usage: {}", format_code("/unwatch <symbols>")));
        }
        let current = self.control.get_symbols();
        let remaining: Vec<String> = current
            .iter()
            .filter(|symbol| !symbols.contains(symbol))
            .cloned()
            .collect();
        let removed: Vec<String> = symbols
            .into_iter()
            .filter(|symbol| current.contains(symbol))
            .collect();
        self.control.update_symbols(remaining.clone());
        if removed.is_empty() {
            return CommandResponse::text("no matching symbols to remove");
        }
        if remaining.is_empty() {
            return CommandResponse::text(format!(
                "removed: {} (idle)",
                html_escape(&removed.join(", "))
            ));
        }
        CommandResponse::text(format!("removed: {}", html_escape(&removed.join(", "))))
    }

    fn help_text(&self) -> String {
        [
            "WallWatch commands:",
            "/start - help",
            "/help - list commands",
            "/ping - health check",
            "/status - stream status and counters",
            "/list - list current symbols",
            "/watch <symbols> - set the watch list",
            "/unwatch <symbols> - remove symbols",
            "/smoke - send a synthetic confirmed-wall notification",
        ]
        .join("\n")
    }

    /// Synthetic confirmed event exercising the full formatting and
    /// keyboard path.
    fn build_smoke_message(&self) -> QueuedMessage {
        let event = WallEvent {
            kind: WallEventKind::Confirmed,
            symbol: "VSEH".to_string(),
            side: Side::Buy,
            price: 123.45,
            qty: 6789.0,
            wall_key: "smoke|BUY|123.45".to_string(),
            distance_ticks: 2,
            distance_ticks_to_spread: Some(1),
            ratio_to_median: 7.5,
            dwell_seconds: 3.4,
            qty_change_last_interval: 120.0,
            reason: None,
            thresholds: None,
            session: Uuid::new_v4(),
            ts: Utc::now(),
        };
        let text = format_event_message(&event);
        let reply_markup = if self.include_instrument_button {
            build_instrument_url(&event.symbol, None, self.append_security_share_utm)
                .map(|url| build_inline_keyboard(&url, &self.button_text))
        } else {
            None
        };
        QueuedMessage { text, reply_markup }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime_state::StreamState;
    use chrono::TimeZone;
    use parking_lot::Mutex;

    struct FakeControl {
        symbols: Mutex<Vec<String>>,
        updated: Mutex<Option<Vec<String>>>,
    }

    impl FakeControl {
        fn with(symbols: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                symbols: Mutex::new(symbols.iter().map(|s| s.to_string()).collect()),
                updated: Mutex::new(None),
            })
        }
    }

    impl SubscriptionControl for FakeControl {
        fn update_symbols(&self, symbols: Vec<String>) {
            *self.symbols.lock() = symbols.clone();
            *self.updated.lock() = Some(symbols);
        }

        fn get_symbols(&self) -> Vec<String> {
            self.symbols.lock().clone()
        }
    }

    fn handler_with(
        control: Arc<FakeControl>,
        allowed: &[i64],
        max_symbols: usize,
    ) -> TelegramCommandHandler {
        TelegramCommandHandler::new(
            Arc::new(RuntimeState::new(20)),
            control,
            max_symbols,
            allowed.iter().copied().collect(),
            true,
            "Open in T-Invest",
            false,
        )
    }

    #[test]
    fn parse_command_variants() {
        assert_eq!(
            parse_command("/watch SBER GAZP"),
            Some(ParsedCommand {
                name: "watch".to_string(),
                args: vec!["SBER".to_string(), "GAZP".to_string()],
            })
        );
        assert_eq!(
            parse_command("  /PING@wallwatch_bot  "),
            Some(ParsedCommand {
                name: "ping".to_string(),
                args: Vec::new(),
            })
        );
        assert_eq!(parse_command("hello"), None);
        assert_eq!(parse_command("/"), None);
        assert_eq!(parse_command(""), None);
    }

    #[test]
    fn parse_symbols_splits_and_dedupes() {
        let args = vec!["sber,GAZP".to_string(), "sber".to_string(), " ".to_string()];
        assert_eq!(
            parse_symbols(&args),
            vec!["SBER".to_string(), "GAZP".to_string()]
        );
    }

    #[test]
    fn authorization_blocks_unknown_users() {
        let control = FakeControl::with(&[]);
        let handler = handler_with(control.clone(), &[42], 10);

        let response = handler
            .handle_command("/watch SBER", 1, Some(7))
            .expect("command parsed");
        assert_eq!(response.text.as_deref(), Some("not allowed"));
        assert!(control.updated.lock().is_none());

        let response = handler
            .handle_command("/watch SBER", 1, Some(42))
            .expect("command parsed");
        assert_eq!(response.text.as_deref(), Some("watching: SBER"));
        assert_eq!(
            control.updated.lock().as_deref(),
            Some(&["SBER".to_string()][..])
        );
    }

    #[test]
    fn empty_allow_list_means_no_authorization() {
        let control = FakeControl::with(&[]);
        let handler = handler_with(control, &[], 10);
        let response = handler
            .handle_command("/watch SBER", 1, None)
            .expect("command parsed");
        assert_eq!(response.text.as_deref(), Some("watching: SBER"));
    }

    #[test]
    fn watch_enforces_the_symbol_cap() {
        let control = FakeControl::with(&[]);
        let handler = handler_with(control.clone(), &[], 2);
        let response = handler
            .handle_command("/watch A,B,C", 1, None)
            .expect("command parsed");
        assert_eq!(response.text.as_deref(), Some("Too many symbols (max 2)."));
        assert!(control.updated.lock().is_none());
    }

    #[test]
    fn watch_without_args_shows_usage() {
        let handler = handler_with(FakeControl::with(&[]), &[], 10);
        let response = handler.handle_command("/watch", 1, None).unwrap();
        assert!(response
            .text
            .as_deref()
            .unwrap()
            .contains("<code>/watch &lt;symbols&gt;</code>"));
    }

    #[test]
    fn unwatch_reports_removed_and_idle() {
        let control = FakeControl::with(&["SBER", "GAZP"]);
        let handler = handler_with(control.clone(), &[], 10);

        let response = handler.handle_command("/unwatch GAZP", 1, None).unwrap();
        assert_eq!(response.text.as_deref(), Some("removed: GAZP"));
        assert_eq!(control.get_symbols(), vec!["SBER".to_string()]);

        let response = handler.handle_command("/unwatch LKOH", 1, None).unwrap();
        assert_eq!(response.text.as_deref(), Some("no matching symbols to remove"));

        let response = handler.handle_command("/unwatch SBER", 1, None).unwrap();
        assert_eq!(response.text.as_deref(), Some("removed: SBER (idle)"));
        assert!(control.get_symbols().is_empty());
    }

    #[test]
    fn list_reports_current_symbols() {
        let handler = handler_with(FakeControl::with(&["SBER", "GAZP"]), &[], 10);
        let response = handler.handle_command("/list", 1, None).unwrap();
        assert_eq!(response.text.as_deref(), Some("symbols=SBER, GAZP"));
    }

    #[test]
    fn start_and_help_are_identical() {
        let handler = handler_with(FakeControl::with(&[]), &[], 10);
        let start = handler.handle_command("/start", 1, None).unwrap();
        let help = handler.handle_command("/help", 1, None).unwrap();
        assert_eq!(start.text, help.text);
        assert!(start.text.unwrap().contains("/watch"));
    }

    #[test]
    fn unknown_command_gets_the_canned_reply() {
        let handler = handler_with(FakeControl::with(&[]), &[], 10);
        let response = handler.handle_command("/frobnicate", 1, None).unwrap();
        assert_eq!(response.text.as_deref(), Some("Unknown command. Use /help."));
        assert!(handler.handle_command("plain text", 1, None).is_none());
    }

    #[test]
    fn smoke_exercises_formatting_and_keyboard() {
        let handler = handler_with(FakeControl::with(&[]), &[], 10);
        let response = handler.handle_command("/smoke", 1, None).unwrap();
        assert!(response.text.is_none());
        assert_eq!(response.messages.len(), 1);
        let message = &response.messages[0];
        assert!(message.text.contains("WALL CONFIRMED"));
        assert!(message.text.contains("VSEH"));
        let keyboard = message.reply_markup.as_ref().expect("keyboard");
        assert!(keyboard["inline_keyboard"][0][0]["url"]
            .as_str()
            .unwrap()
            .contains("/stocks/VSEH/"));
    }

    #[test]
    fn replies_escape_user_controlled_text() {
        let control = FakeControl::with(&[]);
        let handler = handler_with(control, &[], 10);
        let response = handler.handle_command("/watch A<B", 1, None).unwrap();
        assert_eq!(response.text.as_deref(), Some("watching: A&lt;B"));
    }

    #[test]
    fn ping_and_status_formatting() {
        let started_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let snapshot = RuntimeStateSnapshot {
            started_at,
            pid: 123,
            stream_state: StreamState::Connected,
            since_last_message_seconds: Some(0.5),
            rx_total_orderbooks: 10,
            rx_total_trades: 5,
            current_symbols: vec!["SBER".to_string()],
            depth: 20,
            last_wall_event: Some(WallEventSummary {
                kind: WallEventKind::Confirmed,
                ts: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 5).unwrap(),
                symbol: "SBER".to_string(),
                side: Side::Buy,
                price: 120.0,
                qty: 100.0,
            }),
            last_error: None,
        };
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 10).unwrap();

        let ping = format_ping_response(&snapshot, now);
        assert_eq!(
            ping,
            "pong 2024-01-01T00:00:10+00:00 uptime=0h0m stream_state=connected \
             rx_total_orderbooks=10 rx_total_trades=5 since_last_message_seconds=0.500s"
        );

        let status = format_status_response(&snapshot);
        assert!(status.contains("state=connected"));
        assert!(status.contains("symbols=SBER"));
        assert!(status.contains("depth=20"));
        assert!(status.contains("wall_confirmed SBER BUY 120 100 @ 2024-01-01T00:00:05+00:00"));
    }

    #[test]
    fn uptime_formatting() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(format_uptime(start, start), "0h0m");
        let later = start + chrono::Duration::minutes(61);
        assert_eq!(format_uptime(start, later), "1h1m");
        let much_later = start + chrono::Duration::hours(30);
        assert_eq!(format_uptime(start, much_later), "30h0m");
    }
}
