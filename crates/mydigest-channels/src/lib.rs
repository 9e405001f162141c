//! # MyDigest Channels
//!
//! Telegram on both ends of the pipeline:
//! - `scraper` — reads public channels through the `t.me/s/` web preview
//! - `telegram` — delivers digests through the Bot API

pub mod scraper;
pub mod telegram;

pub use scraper::TelegramWebScraper;
pub use telegram::TelegramBotSender;
