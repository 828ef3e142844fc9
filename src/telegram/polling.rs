// =============================================================================
// Telegram Polling — long-poll update loop driving the command handler
// =============================================================================
//
// Cooperative loop: request pending updates with a long read timeout,
// advance the integer offset per update, authorize and dispatch commands,
// send replies with the outbound parse-mode settings. Read timeouts are the
// normal quiet case (DEBUG); transient errors back off 1 s doubling to 30 s;
// HTTP 5xx is logged at ERROR.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use crate::telegram::api::{BotApi, OutboundMessage, Update, DEFAULT_POLL_TIMEOUT_SECONDS};
use crate::telegram::commands::TelegramCommandHandler;

const POLL_BACKOFF_INITIAL_SECONDS: f64 = 1.0;
const POLL_BACKOFF_MAX_SECONDS: f64 = 30.0;

pub struct TelegramPolling {
    api: Arc<dyn BotApi>,
    handler: TelegramCommandHandler,
    parse_mode: Option<String>,
    disable_web_preview: bool,
    poll_interval_seconds: f64,
    offset: Option<i64>,
}

impl TelegramPolling {
    pub fn new(
        api: Arc<dyn BotApi>,
        handler: TelegramCommandHandler,
        parse_mode: Option<String>,
        disable_web_preview: bool,
        poll_interval_seconds: f64,
    ) -> Self {
        Self {
            api,
            handler,
            parse_mode,
            disable_web_preview,
            poll_interval_seconds,
            offset: None,
        }
    }

    /// Announce startup to the configured chats.
    pub async fn send_startup_message(&self, chat_ids: &[i64], text: &str) {
        for chat_id in chat_ids {
            self.send(*chat_id, text.to_string(), None).await;
        }
    }

    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        info!("telegram_polling_started");
        let mut backoff = POLL_BACKOFF_INITIAL_SECONDS;
        loop {
            if *stop.borrow() {
                return;
            }
            let result = tokio::select! {
                result = self.api.get_updates(self.offset, DEFAULT_POLL_TIMEOUT_SECONDS) => result,
                _ = stop.changed() => continue,
            };
            let updates = match result {
                Ok(updates) => {
                    backoff = POLL_BACKOFF_INITIAL_SECONDS;
                    updates
                }
                Err(error) if error.is_timeout() => {
                    debug!("telegram_poll_timeout");
                    backoff = POLL_BACKOFF_INITIAL_SECONDS;
                    continue;
                }
                Err(error) => {
                    let redacted = self.api.redact(&error.to_string());
                    match error.status() {
                        Some(status) if status >= 500 => {
                            error!(error = %redacted, status_code = status, "telegram_poll_failed");
                        }
                        Some(status) => {
                            warn!(error = %redacted, status_code = status, "telegram_poll_failed");
                        }
                        None => warn!(error = %redacted, "telegram_poll_failed"),
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs_f64(backoff)) => {}
                        _ = stop.changed() => {}
                    }
                    backoff = (backoff * 2.0).min(POLL_BACKOFF_MAX_SECONDS);
                    continue;
                }
            };

            let empty = updates.is_empty();
            for update in updates {
                self.handle_update(update).await;
            }
            if empty {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs_f64(self.poll_interval_seconds)) => {}
                    _ = stop.changed() => {}
                }
            }
        }
    }

    async fn handle_update(&mut self, update: Update) {
        self.offset = Some(update.update_id + 1);
        let Some(message) = update.message else {
            return;
        };
        let chat_id = message.chat.as_ref().map(|chat| chat.id);
        debug!(
            update_id = update.update_id,
            chat_id = ?chat_id,
            has_text = message.text.is_some(),
            "telegram_update_received"
        );
        let (Some(text), Some(chat_id)) = (message.text, chat_id) else {
            return;
        };
        let user_id = message.from.map(|user| user.id);
        let Some(response) = self.handler.handle_command(&text, chat_id, user_id) else {
            return;
        };
        if let Some(reply) = response.text {
            self.send(chat_id, reply, None).await;
        }
        for extra in response.messages {
            self.send(chat_id, extra.text, extra.reply_markup).await;
        }
    }

    async fn send(&self, chat_id: i64, text: String, reply_markup: Option<serde_json::Value>) {
        let outbound = OutboundMessage {
            chat_id,
            text,
            parse_mode: self.parse_mode.clone(),
            disable_web_preview: self.disable_web_preview,
            reply_markup,
        };
        if let Err(error) = self.api.send_message(outbound).await {
            warn!(error = %self.api.redact(&error.to_string()), "telegram_send_failed");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::manager::SubscriptionControl;
    use crate::runtime_state::RuntimeState;
    use crate::telegram::api::{Chat, IncomingMessage, TelegramApiError, User};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct FakeControl;

    impl SubscriptionControl for FakeControl {
        fn update_symbols(&self, _symbols: Vec<String>) {}
        fn get_symbols(&self) -> Vec<String> {
            Vec::new()
        }
    }

    #[derive(Default)]
    struct ScriptedApi {
        responses: Mutex<Vec<Result<Vec<Update>, TelegramApiError>>>,
        offsets: Mutex<Vec<Option<i64>>>,
        sent: Mutex<Vec<OutboundMessage>>,
        stop_tx: Mutex<Option<watch::Sender<bool>>>,
    }

    #[async_trait]
    impl BotApi for ScriptedApi {
        async fn get_updates(
            &self,
            offset: Option<i64>,
            _timeout_seconds: u64,
        ) -> Result<Vec<Update>, TelegramApiError> {
            self.offsets.lock().push(offset);
            let next = self.responses.lock().pop();
            match next {
                Some(result) => result,
                None => {
                    if let Some(stop_tx) = self.stop_tx.lock().take() {
                        let _ = stop_tx.send(true);
                    }
                    Ok(Vec::new())
                }
            }
        }

        async fn send_message(&self, message: OutboundMessage) -> Result<(), TelegramApiError> {
            self.sent.lock().push(message);
            Ok(())
        }

        fn redact(&self, text: &str) -> String {
            text.to_string()
        }
    }

    fn update_with(update_id: i64, text: &str, chat_id: i64, user_id: i64) -> Update {
        Update {
            update_id,
            message: Some(IncomingMessage {
                text: Some(text.to_string()),
                chat: Some(Chat { id: chat_id }),
                from: Some(User { id: user_id }),
            }),
        }
    }

    fn polling_with(api: Arc<ScriptedApi>) -> TelegramPolling {
        let handler = TelegramCommandHandler::new(
            Arc::new(RuntimeState::new(20)),
            Arc::new(FakeControl),
            10,
            [42].into_iter().collect(),
            false,
            "Open",
            false,
        );
        TelegramPolling::new(api, handler, Some("HTML".to_string()), true, 0.01)
    }

    #[tokio::test(start_paused = true)]
    async fn dispatches_commands_and_advances_the_offset() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let api = Arc::new(ScriptedApi::default());
        // Responses are popped from the back.
        api.responses
            .lock()
            .push(Ok(vec![update_with(10, "/ping", 7, 42)]));
        *api.stop_tx.lock() = Some(stop_tx);

        polling_with(api.clone()).run(stop_rx).await;

        let offsets = api.offsets.lock();
        assert_eq!(offsets[0], None);
        assert!(offsets[1..].iter().all(|offset| *offset == Some(11)));

        let sent = api.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].chat_id, 7);
        assert!(sent[0].text.starts_with("pong"));
        assert_eq!(sent[0].parse_mode.as_deref(), Some("HTML"));
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_users_get_refused() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let api = Arc::new(ScriptedApi::default());
        api.responses
            .lock()
            .push(Ok(vec![update_with(5, "/watch SBER", 7, 1)]));
        *api.stop_tx.lock() = Some(stop_tx);

        polling_with(api.clone()).run(stop_rx).await;

        let sent = api.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].text, "not allowed");
    }

    #[tokio::test(start_paused = true)]
    async fn updates_without_text_or_chat_are_skipped() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let api = Arc::new(ScriptedApi::default());
        api.responses.lock().push(Ok(vec![
            Update {
                update_id: 1,
                message: None,
            },
            Update {
                update_id: 2,
                message: Some(IncomingMessage {
                    text: None,
                    chat: Some(Chat { id: 7 }),
                    from: None,
                }),
            },
        ]));
        *api.stop_tx.lock() = Some(stop_tx);

        polling_with(api.clone()).run(stop_rx).await;

        assert!(api.sent.lock().is_empty());
        // Offsets still advance past skipped updates.
        assert!(api.offsets.lock().contains(&Some(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_errors_back_off_and_recover() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let api = Arc::new(ScriptedApi::default());
        api.responses.lock().push(Err(TelegramApiError::Http {
            status: 502,
            description: Some("bad gateway".to_string()),
        }));
        *api.stop_tx.lock() = Some(stop_tx);

        polling_with(api.clone()).run(stop_rx).await;

        // One failed poll, then the terminating empty poll.
        assert!(api.offsets.lock().len() >= 2);
        assert!(api.sent.lock().is_empty());
    }
}
