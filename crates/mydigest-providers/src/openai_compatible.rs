//! Unified OpenAI-compatible text generator.
//!
//! One struct covers every chat-completions API in the registry. The digest
//! prompt goes out as a single user message; the first choice comes back.

use std::time::Duration;

use async_trait::async_trait;
use mydigest_core::config::LlmConfig;
use mydigest_core::{DigestError, Result, TextGenerator, parse_retry_after};
use serde_json::{Value, json};

use crate::provider_registry::{AuthStyle, ProviderConfig};

pub struct OpenAiCompatibleGenerator {
    /// Provider name (e.g., "mistral", "openai").
    name: String,
    api_key: String,
    base_url: String,
    chat_path: String,
    auth_style: AuthStyle,
    model: String,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
}

impl OpenAiCompatibleGenerator {
    /// Create from a known provider config + `[llm]` settings.
    ///
    /// Resolution order:
    /// - API key: `llm.api_key` > env vars > empty
    /// - Base URL: `llm.endpoint` > env override > registry default
    /// - Model: `llm.model` > registry default
    pub fn from_registry(registry: &ProviderConfig, llm: &LlmConfig) -> Result<Self> {
        let api_key = if !llm.api_key.is_empty() {
            llm.api_key.clone()
        } else {
            registry
                .env_keys
                .iter()
                .find_map(|key| std::env::var(key).ok())
                .unwrap_or_default()
        };

        let base_url = if !llm.endpoint.is_empty() {
            llm.endpoint.trim_end_matches('/').to_string()
        } else {
            registry
                .base_url_env
                .and_then(|env_key| {
                    let val = std::env::var(env_key).ok()?;
                    // OLLAMA_HOST usually comes without the /v1 suffix
                    if val.ends_with("/v1") {
                        Some(val)
                    } else {
                        Some(format!("{}/v1", val.trim_end_matches('/')))
                    }
                })
                .unwrap_or_else(|| registry.base_url.to_string())
        };

        let model = if llm.model.is_empty() {
            registry.default_model.to_string()
        } else {
            llm.model.clone()
        };

        Ok(Self {
            name: registry.name.to_string(),
            api_key,
            base_url,
            chat_path: registry.chat_path.to_string(),
            auth_style: registry.auth_style,
            model,
            temperature: llm.temperature,
            max_tokens: llm.max_tokens,
            client: build_client(llm.request_timeout_secs)?,
        })
    }

    /// Create for a custom endpoint (e.g., "custom:https://my-server.com/v1").
    pub fn custom(endpoint: &str, llm: &LlmConfig) -> Result<Self> {
        let base_url = endpoint
            .strip_prefix("custom:")
            .unwrap_or(endpoint)
            .trim_end_matches('/')
            .to_string();

        let api_key = if !llm.api_key.is_empty() {
            llm.api_key.clone()
        } else {
            std::env::var("CUSTOM_API_KEY").unwrap_or_default()
        };

        let auth_style = if api_key.is_empty() {
            AuthStyle::None
        } else {
            AuthStyle::Bearer
        };

        Ok(Self {
            name: "custom".to_string(),
            api_key,
            base_url,
            chat_path: "/chat/completions".to_string(),
            auth_style,
            model: llm.model.clone(),
            temperature: llm.temperature,
            max_tokens: llm.max_tokens,
            client: build_client(llm.request_timeout_secs)?,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Build the auth header for the request.
    fn apply_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.auth_style {
            AuthStyle::Bearer if !self.api_key.is_empty() => {
                req.header("Authorization", format!("Bearer {}", self.api_key))
            }
            _ => req,
        }
    }
}

fn build_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .build()
        .map_err(|e| DigestError::Http(format!("client init failed: {e}")))
}

#[async_trait]
impl TextGenerator for OpenAiCompatibleGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        if self.auth_style != AuthStyle::None && self.api_key.is_empty() {
            return Err(DigestError::Config(format!(
                "API key missing for provider '{}'",
                self.name
            )));
        }

        let body = json!({
            "model": self.model,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let url = format!("{}{}", self.base_url, self.chat_path);
        let req = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body);
        let req = self.apply_auth(req);

        let resp = req.send().await.map_err(|e| {
            DigestError::Http(format!("{} connection failed ({}): {}", self.name, url, e))
        })?;

        let status = resp.status();
        if status.as_u16() == 429 {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            tracing::debug!(provider = %self.name, ?retry_after, "🚦 Provider rate limited");
            return Err(DigestError::rate_limited(retry_after));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(DigestError::Http(format!(
                "{} API error {}: {}",
                self.name, status, text
            )));
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| DigestError::Http(e.to_string()))?;

        let choice = json["choices"]
            .get(0)
            .ok_or_else(|| DigestError::Summarization(format!("{}: no choices in response", self.name)))?;
        let content = choice["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        if let Some(usage) = json["usage"].as_object() {
            tracing::debug!(
                provider = %self.name,
                prompt_tokens = usage.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                completion_tokens = usage.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                "🧠 Completion received"
            );
        }
        Ok(content)
    }
}
