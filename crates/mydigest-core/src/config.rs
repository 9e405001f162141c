//! MyDigest configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{DigestError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MyDigestConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub scraper: ScraperConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

impl MyDigestConfig {
    /// Load config from the default path (~/.mydigest/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DigestError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| DigestError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to a path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| DigestError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the MyDigest home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".mydigest")
    }

    /// Bot token from config, falling back to `TELEGRAM_BOT_TOKEN`.
    pub fn bot_token(&self) -> Option<String> {
        if !self.telegram.bot_token.is_empty() {
            return Some(self.telegram.bot_token.clone());
        }
        std::env::var("TELEGRAM_BOT_TOKEN")
            .ok()
            .filter(|t| !t.is_empty())
    }
}

/// Delivery bot settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Telegram rejects messages longer than 4096 characters.
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,
    #[serde(default = "default_chunk_pacing_ms")]
    pub chunk_pacing_ms: u64,
}

fn default_api_base() -> String { "https://api.telegram.org".into() }
fn default_max_message_len() -> usize { 4096 }
fn default_chunk_pacing_ms() -> u64 { 500 }

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            api_base: default_api_base(),
            max_message_len: default_max_message_len(),
            chunk_pacing_ms: default_chunk_pacing_ms(),
        }
    }
}

impl TelegramConfig {
    pub fn chunk_pacing(&self) -> Duration {
        Duration::from_millis(self.chunk_pacing_ms)
    }
}

/// Channel scraping settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperConfig {
    #[serde(default = "default_scraper_base")]
    pub base_url: String,
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: usize,
    /// Fixed pause between two sources of the same cycle.
    #[serde(default = "default_source_pacing_ms")]
    pub source_pacing_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_scraper_attempts")]
    pub max_attempts: u32,
    /// Resume delay assumed when a 429 carries no `Retry-After`.
    #[serde(default = "default_flood_wait")]
    pub default_flood_wait_secs: u64,
}

fn default_scraper_base() -> String { "https://t.me".into() }
fn default_fetch_limit() -> usize { 50 }
fn default_source_pacing_ms() -> u64 { 1000 }
fn default_request_timeout() -> u64 { 30 }
fn default_scraper_attempts() -> u32 { 3 }
fn default_flood_wait() -> u64 { 5 }

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            base_url: default_scraper_base(),
            fetch_limit: default_fetch_limit(),
            source_pacing_ms: default_source_pacing_ms(),
            request_timeout_secs: default_request_timeout(),
            max_attempts: default_scraper_attempts(),
            default_flood_wait_secs: default_flood_wait(),
        }
    }
}

impl ScraperConfig {
    pub fn source_pacing(&self) -> Duration {
        Duration::from_millis(self.source_pacing_ms)
    }
}

/// Summarization endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: String,
    /// Overrides the registry base URL, e.g. a self-hosted gateway.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Language the digest is written in.
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_provider() -> String { "mistral".into() }
fn default_model() -> String { "mistral-large-latest".into() }
fn default_temperature() -> f32 { 0.3 }
fn default_max_tokens() -> u32 { 2048 }
fn default_language() -> String { "English".into() }

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            api_key: String::new(),
            endpoint: String::new(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout(),
            language: default_language(),
        }
    }
}

/// Backoff for the summarization endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_max_jitter")]
    pub max_jitter_ms: u64,
}

fn default_base_delay() -> u64 { 1000 }
fn default_multiplier() -> f64 { 2.0 }
fn default_max_delay() -> u64 { 30_000 }
fn default_max_attempts() -> u32 { 5 }
fn default_max_jitter() -> u64 { 250 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay(),
            max_attempts: default_max_attempts(),
            max_jitter_ms: default_max_jitter(),
        }
    }
}

/// Per-user loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_interval")]
    pub default_interval_secs: u64,
    /// Lower bound on the fetch window, so short intervals still look back far enough.
    #[serde(default = "default_min_window")]
    pub min_window_secs: u64,
    /// Raw items older than this are pruned every cycle.
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,
    /// How often `serve` re-reads active users and intervals from the database.
    #[serde(default = "default_reconcile")]
    pub reconcile_secs: u64,
}

fn default_interval() -> u64 { 3600 }
fn default_min_window() -> u64 { 3600 }
fn default_retention() -> u64 { 86_400 }
fn default_store_timeout() -> u64 { 2000 }
fn default_reconcile() -> u64 { 30 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_interval_secs: default_interval(),
            min_window_secs: default_min_window(),
            retention_secs: default_retention(),
            store_timeout_ms: default_store_timeout(),
            reconcile_secs: default_reconcile(),
        }
    }
}

impl SchedulerConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_secs.max(1))
    }
}

/// SQLite location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.mydigest/mydigest.db".into() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

impl DatabaseConfig {
    /// Path with `~` expanded.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}
