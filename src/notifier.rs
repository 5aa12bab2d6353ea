// =============================================================================
// Notifier / Postback — narrow outbound sinks for an emitted ProposalCard
// =============================================================================
//
// Both capabilities are deliberately narrow: a sink takes a JSON payload and
// reports whether delivery succeeded, the HTTP status if any, and latency.
// Message formatting, interactive callbacks, and retry/backoff policy for
// the outbound wire protocol are out of scope — see the original Telegram
// client's keyboard/callback handling, none of which this crate reproduces.
// When a sink is unconfigured (`enabled == false`) it no-ops and reports
// success, so a symbol with no notifier wired up never blocks the pipeline.

use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::warn;

/// Result of attempting to deliver a card to the notifier sink.
#[derive(Debug, Clone)]
pub struct NotifierOutcome {
    pub ok: bool,
    pub status: Option<u16>,
    pub message_id: Option<i64>,
    pub latency_ms: u64,
}

/// Result of attempting to deliver a card to the postback sink.
#[derive(Debug, Clone)]
pub struct PostbackOutcome {
    pub ok: bool,
    pub status: Option<u16>,
    pub latency_ms: u64,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_json_card(&self, payload: &Value) -> Result<NotifierOutcome>;
}

#[async_trait]
pub trait Postback: Send + Sync {
    async fn send(&self, payload: &Value) -> Result<PostbackOutcome>;
}

/// Sends a formatted message to a Telegram bot chat. Disabled (a no-op
/// `Ok`) when either `bot_token` or `chat_id` is empty.
pub struct TelegramNotifier {
    client: Client,
    bot_token: String,
    chat_id: String,
    enabled: bool,
}

impl TelegramNotifier {
    pub fn new(bot_token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        let bot_token = bot_token.into();
        let chat_id = chat_id.into();
        let enabled = !bot_token.is_empty() && !chat_id.is_empty();
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("failed to build telegram http client"),
            bot_token,
            chat_id,
            enabled,
        }
    }

    fn endpoint(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{}", self.bot_token, method)
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send_json_card(&self, payload: &Value) -> Result<NotifierOutcome> {
        if !self.enabled {
            return Ok(NotifierOutcome { ok: true, status: None, message_id: None, latency_ms: 0 });
        }

        let text = payload.to_string();
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
        });

        let start = Instant::now();
        let resp = self
            .client
            .post(self.endpoint("sendMessage"))
            .json(&body)
            .send()
            .await
            .context("telegram sendMessage request failed")?;
        let latency_ms = start.elapsed().as_millis() as u64;
        let status = resp.status().as_u16();

        if resp.status().is_success() {
            let parsed: Value = resp.json().await.unwrap_or(Value::Null);
            let message_id = parsed
                .get("result")
                .and_then(|r| r.get("message_id"))
                .and_then(Value::as_i64);
            Ok(NotifierOutcome { ok: true, status: Some(status), message_id, latency_ms })
        } else {
            warn!(status, "telegram_send_failed");
            Ok(NotifierOutcome { ok: false, status: Some(status), message_id: None, latency_ms })
        }
    }
}

/// Posts the card payload as-is to a configured URL. Disabled (a no-op
/// `Ok`) when the URL is empty.
pub struct HttpPostback {
    client: Client,
    url: String,
    enabled: bool,
}

impl HttpPostback {
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let enabled = !url.is_empty();
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("failed to build postback http client"),
            url,
            enabled,
        }
    }
}

#[async_trait]
impl Postback for HttpPostback {
    async fn send(&self, payload: &Value) -> Result<PostbackOutcome> {
        if !self.enabled {
            return Ok(PostbackOutcome { ok: true, status: None, latency_ms: 0 });
        }

        let start = Instant::now();
        let resp = self
            .client
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .context("postback request failed")?;
        let latency_ms = start.elapsed().as_millis() as u64;
        let status = resp.status().as_u16();

        if resp.status().is_success() {
            Ok(PostbackOutcome { ok: true, status: Some(status), latency_ms })
        } else {
            warn!(status, "postback_send_failed");
            Ok(PostbackOutcome { ok: false, status: Some(status), latency_ms })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_telegram_notifier_noops_successfully() {
        let notifier = TelegramNotifier::new("", "");
        let outcome = notifier.send_json_card(&serde_json::json!({"symbol": "BTCUSDT"})).await.unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.status, None);
        assert_eq!(outcome.latency_ms, 0);
    }

    #[tokio::test]
    async fn disabled_postback_noops_successfully() {
        let postback = HttpPostback::new("");
        let outcome = postback.send(&serde_json::json!({"symbol": "BTCUSDT"})).await.unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.status, None);
    }
}
