//! Telegram Bot delivery — sends digests via the Bot API `sendMessage`.

use std::time::Duration;

use async_trait::async_trait;
use mydigest_core::config::TelegramConfig;
use mydigest_core::{DeliveryTransport, DigestError, Result, SendOutcome, UserId};
use serde::{Deserialize, Serialize};

/// Descriptions the Bot API uses for chats that will never accept a message.
const GONE_FOR_GOOD: &[&str] = &[
    "bot was blocked by the user",
    "user is deactivated",
    "chat not found",
    "bot was kicked",
    "bot can't initiate conversation",
];

/// Delivery transport backed by a Telegram bot.
pub struct TelegramBotSender {
    bot_token: String,
    api_base: String,
    client: reqwest::Client,
}

impl TelegramBotSender {
    pub fn new(bot_token: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            bot_token: bot_token.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Build from the `[telegram]` section; `token` is the resolved bot token.
    pub fn from_config(config: &TelegramConfig, token: Option<String>) -> Result<Self> {
        let token = token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| DigestError::Config("telegram bot token is not set".into()))?;
        Ok(Self::new(token, config.api_base.as_str()))
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.bot_token, method)
    }

    /// Send one HTML-formatted message.
    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<SendOutcome> {
        let result = self.post_message(chat_id, text, Some("HTML")).await?;
        if result.ok {
            return Ok(SendOutcome::Sent);
        }

        let description = result.description.unwrap_or_default();
        // Model output occasionally carries markup Telegram rejects.
        if description.contains("can't parse entities") {
            tracing::warn!(chat_id, "⚠️ HTML rejected, resending as plain text");
            let retry = self.post_message(chat_id, text, None).await?;
            if retry.ok {
                return Ok(SendOutcome::Sent);
            }
            return Ok(classify(
                retry.error_code,
                &retry.description.unwrap_or_default(),
                retry.parameters.and_then(|p| p.retry_after),
            ));
        }

        Ok(classify(
            result.error_code,
            &description,
            result.parameters.and_then(|p| p.retry_after),
        ))
    }

    async fn post_message(
        &self,
        chat_id: i64,
        text: &str,
        parse_mode: Option<&str>,
    ) -> Result<TelegramApiResponse<serde_json::Value>> {
        let mut body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "disable_web_page_preview": true,
        });
        if let Some(mode) = parse_mode {
            body["parse_mode"] = serde_json::Value::String(mode.into());
        }

        let response = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| DigestError::Http(format!("sendMessage failed: {e}")))?;

        response
            .json()
            .await
            .map_err(|e| DigestError::Http(format!("Invalid send response: {e}")))
    }

    /// Get bot info; doubles as a token check.
    pub async fn get_me(&self) -> Result<TelegramUser> {
        let response = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|e| DigestError::Http(format!("getMe failed: {e}")))?;

        let body: TelegramApiResponse<TelegramUser> = response
            .json()
            .await
            .map_err(|e| DigestError::Http(format!("Invalid getMe response: {e}")))?;

        match body.result {
            Some(user) if body.ok => Ok(user),
            _ => Err(DigestError::Config(format!(
                "Telegram rejected the bot token: {}",
                body.description.unwrap_or_default()
            ))),
        }
    }
}

/// Map a failed Bot API call onto a delivery outcome.
fn classify(error_code: Option<i64>, description: &str, retry_after: Option<u64>) -> SendOutcome {
    let lower = description.to_lowercase();
    match error_code {
        Some(403) => SendOutcome::Unreachable(description.to_string()),
        Some(400) if GONE_FOR_GOOD.iter().any(|m| lower.contains(m)) => {
            SendOutcome::Unreachable(description.to_string())
        }
        Some(429) => SendOutcome::Failed(format!(
            "{description} (retry after {}s)",
            retry_after.unwrap_or(0)
        )),
        Some(code) => SendOutcome::Failed(format!("{code}: {description}")),
        None => SendOutcome::Failed(description.to_string()),
    }
}

#[async_trait]
impl DeliveryTransport for TelegramBotSender {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, user_id: UserId, text: &str) -> Result<SendOutcome> {
        let outcome = self.send_message(user_id, text).await?;
        if let SendOutcome::Unreachable(reason) = &outcome {
            tracing::warn!(user_id, "🚫 Telegram recipient unreachable: {reason}");
        }
        Ok(outcome)
    }
}

// ── Telegram API types ──────────────────────────────

#[derive(Debug, Deserialize)]
pub struct TelegramApiResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    pub description: Option<String>,
    pub error_code: Option<i64>,
    pub parameters: Option<ResponseParameters>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseParameters {
    pub retry_after: Option<u64>,
    pub migrate_to_chat_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    pub is_bot: bool,
    pub first_name: String,
    pub username: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sender(server: &MockServer) -> TelegramBotSender {
        TelegramBotSender::new("123:abc", server.uri())
    }

    #[tokio::test]
    async fn test_send_html_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:abc/sendMessage"))
            .and(body_partial_json(json!({
                "chat_id": 42,
                "text": "<b>Digest</b>",
                "parse_mode": "HTML"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "result": {"message_id": 1}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = sender(&server).send(42, "<b>Digest</b>").await.unwrap();
        assert_eq!(outcome, SendOutcome::Sent);
    }

    #[tokio::test]
    async fn test_blocked_bot_is_unreachable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:abc/sendMessage"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "ok": false,
                "error_code": 403,
                "description": "Forbidden: bot was blocked by the user"
            })))
            .mount(&server)
            .await;

        let outcome = sender(&server).send(42, "hi").await.unwrap();
        assert!(matches!(outcome, SendOutcome::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_flood_control_is_a_soft_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:abc/sendMessage"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "ok": false,
                "error_code": 429,
                "description": "Too Many Requests: retry after 7",
                "parameters": {"retry_after": 7}
            })))
            .mount(&server)
            .await;

        let outcome = sender(&server).send(42, "hi").await.unwrap();
        match outcome {
            SendOutcome::Failed(reason) => assert!(reason.contains("7s")),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bad_markup_falls_back_to_plain_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:abc/sendMessage"))
            .and(body_partial_json(json!({"parse_mode": "HTML"})))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "ok": false,
                "error_code": 400,
                "description": "Bad Request: can't parse entities: unclosed tag"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/bot123:abc/sendMessage"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "result": {"message_id": 2}
            })))
            .mount(&server)
            .await;

        let outcome = sender(&server).send(42, "<b>oops").await.unwrap();
        assert_eq!(outcome, SendOutcome::Sent);
    }

    #[test]
    fn test_classify() {
        assert!(matches!(
            classify(Some(400), "Bad Request: chat not found", None),
            SendOutcome::Unreachable(_)
        ));
        assert!(matches!(
            classify(Some(400), "Bad Request: message is too long", None),
            SendOutcome::Failed(_)
        ));
        assert!(matches!(
            classify(Some(502), "Bad Gateway", None),
            SendOutcome::Failed(_)
        ));
    }

    #[test]
    fn test_missing_token_is_config_error() {
        let config = TelegramConfig::default();
        assert!(matches!(
            TelegramBotSender::from_config(&config, None),
            Err(DigestError::Config(_))
        ));
    }
}
