// =============================================================================
// Telegram Bot API Client — sendMessage / getUpdates over HTTPS
// =============================================================================
//
// Thin JSON client over the Bot API. Long polls use a generous read timeout
// (the poll timeout plus headroom); sends use a short one. 4xx responses are
// parsed for the `description` field; the token never appears in error text
// handed to the logs — callers pass messages through `redact`.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

/// Long-poll read timeout requested from the server (seconds).
pub const DEFAULT_POLL_TIMEOUT_SECONDS: u64 = 45;

/// Extra client-side headroom on top of the poll timeout (seconds).
const POLL_TIMEOUT_HEADROOM_SECONDS: u64 = 5;

/// Read timeout for sendMessage calls (seconds).
const SEND_TIMEOUT_SECONDS: u64 = 10;

const API_BASE: &str = "https://api.telegram.org";

// =============================================================================
// Error
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TelegramApiError {
    #[error("telegram request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("HTTP {status}: {}", .description.as_deref().unwrap_or("no description"))]
    Http {
        status: u16,
        description: Option<String>,
    },
    #[error("telegram response was not ok: {}", .description.as_deref().unwrap_or("no description"))]
    NotOk { description: Option<String> },
}

impl TelegramApiError {
    /// True for client-side read timeouts (expected on quiet long polls).
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Transport(error) if error.is_timeout())
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::Transport(error) => error.status().map(|s| s.as_u16()),
            Self::NotOk { .. } => None,
        }
    }
}

// =============================================================================
// Wire records
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<IncomingMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub chat: Option<Chat>,
    #[serde(default)]
    pub from: Option<User>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    result: serde_json::Value,
    #[serde(default)]
    description: Option<String>,
}

/// One outbound message, fully addressed.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub chat_id: i64,
    pub text: String,
    pub parse_mode: Option<String>,
    pub disable_web_preview: bool,
    pub reply_markup: Option<serde_json::Value>,
}

// =============================================================================
// Capability trait
// =============================================================================

/// Bot API capability used by the polling loop and the notifier worker.
/// Implemented by [`TelegramApi`] and by fakes in tests.
#[async_trait]
pub trait BotApi: Send + Sync {
    async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout_seconds: u64,
    ) -> Result<Vec<Update>, TelegramApiError>;

    async fn send_message(&self, message: OutboundMessage) -> Result<(), TelegramApiError>;

    /// Strip the bot token from a message before it reaches the logs.
    fn redact(&self, text: &str) -> String;
}

// =============================================================================
// HTTP implementation
// =============================================================================

pub struct TelegramApi {
    token: String,
    base_url: String,
    poll_client: reqwest::Client,
    send_client: reqwest::Client,
}

impl TelegramApi {
    pub fn new(token: impl Into<String>) -> Self {
        let poll_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(
                DEFAULT_POLL_TIMEOUT_SECONDS + POLL_TIMEOUT_HEADROOM_SECONDS,
            ))
            .build()
            .expect("failed to build reqwest client");
        let send_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(SEND_TIMEOUT_SECONDS))
            .build()
            .expect("failed to build reqwest client");
        Self {
            token: token.into(),
            base_url: API_BASE.to_string(),
            poll_client,
            send_client,
        }
    }

    fn url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token, method)
    }

    async fn post_json(
        &self,
        client: &reqwest::Client,
        method: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, TelegramApiError> {
        let response = client
            .post(self.url(method))
            .header("Content-Type", "application/json; charset=utf-8")
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            let description = serde_json::from_str::<Envelope>(&body)
                .ok()
                .and_then(|envelope| envelope.description);
            return Err(TelegramApiError::Http {
                status: status.as_u16(),
                description,
            });
        }
        let envelope: Envelope =
            serde_json::from_str(&body).map_err(|_| TelegramApiError::NotOk {
                description: Some("response was not JSON".to_string()),
            })?;
        if !envelope.ok {
            return Err(TelegramApiError::NotOk {
                description: envelope.description,
            });
        }
        Ok(envelope.result)
    }
}

#[async_trait]
impl BotApi for TelegramApi {
    async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout_seconds: u64,
    ) -> Result<Vec<Update>, TelegramApiError> {
        let mut payload = serde_json::json!({ "timeout": timeout_seconds });
        if let Some(offset) = offset {
            payload["offset"] = serde_json::json!(offset);
        }
        let result = self
            .post_json(&self.poll_client, "getUpdates", payload)
            .await?;
        let updates: Vec<Update> =
            serde_json::from_value(result).map_err(|_| TelegramApiError::NotOk {
                description: Some("getUpdates result did not parse".to_string()),
            })?;
        debug!(count = updates.len(), "telegram updates received");
        Ok(updates)
    }

    async fn send_message(&self, message: OutboundMessage) -> Result<(), TelegramApiError> {
        let mut payload = serde_json::json!({
            "chat_id": message.chat_id,
            "text": message.text,
            "disable_web_page_preview": message.disable_web_preview,
        });
        if let Some(parse_mode) = &message.parse_mode {
            payload["parse_mode"] = serde_json::json!(parse_mode);
        }
        if let Some(reply_markup) = &message.reply_markup {
            payload["reply_markup"] = reply_markup.clone();
        }
        self.post_json(&self.send_client, "sendMessage", payload)
            .await?;
        Ok(())
    }

    fn redact(&self, text: &str) -> String {
        if self.token.is_empty() {
            text.to_string()
        } else {
            text.replace(&self.token, "***")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_embeds_the_token() {
        let api = TelegramApi::new("123:abc");
        assert_eq!(
            api.url("sendMessage"),
            "https://api.telegram.org/bot123:abc/sendMessage"
        );
    }

    #[test]
    fn redact_strips_the_token() {
        let api = TelegramApi::new("123:abc");
        let message = "https://api.telegram.org/bot123:abc/sendMessage failed";
        assert_eq!(
            api.redact(message),
            "https://api.telegram.org/bot***/sendMessage failed"
        );
        let empty = TelegramApi::new("");
        assert_eq!(empty.redact("unchanged"), "unchanged");
    }

    #[test]
    fn update_parses_partial_payloads() {
        let update: Update = serde_json::from_str(r#"{ "update_id": 10 }"#).unwrap();
        assert_eq!(update.update_id, 10);
        assert!(update.message.is_none());

        let update: Update = serde_json::from_str(
            r#"{
                "update_id": 11,
                "message": {
                    "text": "/ping",
                    "chat": { "id": 7 },
                    "from": { "id": 42 }
                }
            }"#,
        )
        .unwrap();
        let message = update.message.unwrap();
        assert_eq!(message.text.as_deref(), Some("/ping"));
        assert_eq!(message.chat.unwrap().id, 7);
        assert_eq!(message.from.unwrap().id, 42);
    }

    #[test]
    fn timeout_detection_only_for_timeouts() {
        let error = TelegramApiError::Http {
            status: 502,
            description: None,
        };
        assert!(!error.is_timeout());
        assert_eq!(error.status(), Some(502));
    }
}
