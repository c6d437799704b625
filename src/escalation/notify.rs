//! Operator notifications.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::error::EscalationError;

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// False for placeholder implementations; the escalator skips them.
    fn is_enabled(&self) -> bool {
        true
    }

    async fn send_text(&self, text: &str) -> Result<(), EscalationError>;
}

pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn send_text(&self, _text: &str) -> Result<(), EscalationError> {
        Ok(())
    }
}

/// Sends plain-text messages to one chat through the Bot API.
pub struct TelegramNotifier {
    bot_token: SecretString,
    chat_id: String,
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(bot_token: SecretString, chat_id: String) -> Self {
        Self {
            bot_token,
            chat_id,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "https://api.telegram.org/bot{}/{method}",
            self.bot_token.expose_secret()
        )
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send_text(&self, text: &str) -> Result<(), EscalationError> {
        let text: String = text.chars().take(TELEGRAM_MAX_MESSAGE_LENGTH).collect();
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
            "disable_web_page_preview": true,
        });

        let resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await
            // reqwest errors can carry the URL, which embeds the token
            .map_err(|e| EscalationError::Notify(e.without_url().to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let detail = resp.text().await.unwrap_or_default();
            return Err(EscalationError::Notify(format!(
                "sendMessage returned {status}: {detail}"
            )));
        }
        tracing::debug!(chat_id = %self.chat_id, "Telegram notification sent");
        Ok(())
    }
}
