//! # MyDigest — Telegram channel digests on a schedule
//!
//! Usage:
//!   mydigest init                          # Write a default config
//!   mydigest serve                         # Run every active user's digest loop
//!   mydigest subscribe 42 @rustlang        # Operator commands against the store
//!   mydigest set-interval 42 7200

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mydigest_channels::{TelegramBotSender, TelegramWebScraper};
use mydigest_core::{MyDigestConfig, Store};
use mydigest_scheduler::{SqliteStore, UserTaskScheduler, check_interval};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "mydigest",
    version,
    about = "📰 MyDigest — per-user Telegram channel digests"
)]
struct Cli {
    /// Config file (default: ~/.mydigest/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file if none exists
    Init,
    /// Recover active users and run their digest loops until Ctrl-C
    Serve,
    /// Register a user
    AddUser {
        user_id: i64,
        #[arg(long)]
        username: Option<String>,
    },
    /// Subscribe a user to channels (@name, name or https://t.me/name)
    Subscribe {
        user_id: i64,
        #[arg(required = true)]
        channels: Vec<String>,
    },
    /// Unsubscribe a user from channels
    Unsubscribe {
        user_id: i64,
        #[arg(required = true)]
        channels: Vec<String>,
    },
    /// List a user's subscriptions
    Sources { user_id: i64 },
    /// Flag a user to receive digests
    Activate { user_id: i64 },
    /// Stop sending digests to a user
    Deactivate { user_id: i64 },
    /// Change how often a user gets a digest
    SetInterval { user_id: i64, secs: u64 },
    /// Show a user's most recent digests
    Digests {
        user_id: i64,
        #[arg(long, default_value = "5")]
        limit: usize,
    },
}

fn config_path(cli: &Cli) -> PathBuf {
    match &cli.config {
        Some(p) => PathBuf::from(shellexpand::tilde(p).to_string()),
        None => MyDigestConfig::default_path(),
    }
}

fn load_config(path: &std::path::Path) -> Result<MyDigestConfig> {
    if path.exists() {
        Ok(MyDigestConfig::load_from(path)?)
    } else {
        Ok(MyDigestConfig::default())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "mydigest=debug,mydigest_scheduler=debug,mydigest_channels=debug,mydigest_providers=debug"
    } else {
        "mydigest=info,mydigest_scheduler=info,mydigest_channels=info,mydigest_providers=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let path = config_path(&cli);
    if let Command::Init = cli.command {
        if path.exists() {
            println!("⚠️  Config already exists: {}", path.display());
        } else {
            match &cli.config {
                Some(_) => MyDigestConfig::default().save_to(&path)?,
                None => MyDigestConfig::default().save()?,
            }
            println!("✅ Wrote default config to {}", path.display());
        }
        return Ok(());
    }

    let config = load_config(&path)?;
    let applied_within = config.scheduler.reconcile_interval().as_secs();
    let db_path = config.database.resolved_path();
    let store = Arc::new(
        SqliteStore::open(&db_path)
            .with_context(|| format!("opening database {}", db_path.display()))?,
    );

    match cli.command {
        Command::Init => {}
        Command::Serve => serve(config, store).await?,
        Command::AddUser { user_id, username } => {
            store.add_user(user_id, username.as_deref())?;
            println!("✅ User {user_id} registered");
        }
        Command::Subscribe { user_id, channels } => {
            for channel in &channels {
                match store.subscribe(user_id, channel) {
                    Ok(source) => println!("✅ {user_id} → {} ({})", source.display_name, source.link),
                    Err(e) => println!("❌ {channel}: {e}"),
                }
            }
        }
        Command::Unsubscribe { user_id, channels } => {
            for channel in &channels {
                if store.unsubscribe(user_id, channel)? {
                    println!("🗑️  {user_id} ✕ {channel}");
                } else {
                    println!("⚠️  {user_id} was not subscribed to {channel}");
                }
            }
        }
        Command::Sources { user_id } => {
            let subs = store.list_subscriptions(user_id)?;
            if subs.is_empty() {
                println!("No subscriptions for {user_id}");
            }
            for sub in subs {
                println!(
                    "{} {:<32} since {}  last seen #{}",
                    if sub.is_active { "●" } else { "○" },
                    sub.source.display_name,
                    sub.added_at.format("%Y-%m-%d"),
                    sub.last_item_id.map_or_else(|| "-".to_string(), |id| id.to_string())
                );
            }
        }
        Command::Activate { user_id } => {
            store.set_user_active(user_id, true).await?;
            println!("▶️  {user_id} active (a running `serve` picks this up within {applied_within}s)");
        }
        Command::Deactivate { user_id } => {
            store.set_user_active(user_id, false).await?;
            println!("⏹️  {user_id} inactive (a running `serve` stops the loop within {applied_within}s)");
        }
        Command::SetInterval { user_id, secs } => {
            let interval = Duration::from_secs(secs);
            check_interval(interval)?;
            store.set_user_interval(user_id, interval).await?;
            println!("⏱️  {user_id} every {secs}s (a running `serve` restarts the loop within {applied_within}s)");
        }
        Command::Digests { user_id, limit } => {
            for digest in store.recent_digests(user_id, limit)? {
                println!("── {} ──\n{}\n", digest.created_at.to_rfc3339(), digest.content);
            }
        }
    }
    Ok(())
}

async fn serve(config: MyDigestConfig, store: Arc<SqliteStore>) -> Result<()> {
    let delivery = TelegramBotSender::from_config(&config.telegram, config.bot_token())?;
    match delivery.get_me().await {
        Ok(me) => tracing::info!(
            "🤖 Delivering as @{}",
            me.username.unwrap_or(me.first_name)
        ),
        Err(e) => tracing::warn!("⚠️ Could not verify bot token: {e}"),
    }
    let fetch = TelegramWebScraper::new(&config.scraper)?;
    let generator = mydigest_providers::create_generator(&config)?;
    tracing::info!(
        "🧠 Summarizing with {} ({})",
        generator.name(),
        config.llm.model
    );

    let scheduler = UserTaskScheduler::new(
        store,
        Arc::new(fetch),
        Arc::from(generator),
        Arc::new(delivery),
        &config,
    );
    println!("📰 MyDigest v{}", env!("CARGO_PKG_VERSION"));
    let recovered = scheduler.recover().await?;
    println!("   {recovered} active user(s). Ctrl-C to stop.");

    // Operator commands only touch the database; pick their edits up here.
    let mut reconcile = tokio::time::interval(config.scheduler.reconcile_interval());
    reconcile.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    reconcile.tick().await;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            signal = &mut ctrl_c => {
                signal?;
                break;
            }
            _ = reconcile.tick() => match scheduler.reconcile().await {
                Ok(report) if report.is_empty() => {}
                Ok(report) => tracing::info!(
                    started = report.started,
                    stopped = report.stopped,
                    restarted = report.restarted,
                    "🔄 Applied database changes"
                ),
                Err(e) => tracing::warn!("⚠️ Reconcile skipped: {e}"),
            },
        }
    }
    tracing::info!("Ctrl-C received, shutting down");
    scheduler.shutdown().await;
    Ok(())
}
