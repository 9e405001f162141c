//! SQLite-backed persistence for users, subscriptions, raw items and digests.
//! Survives restarts: the set of active users here is what `recover()` replays.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use mydigest_core::{Digest, DigestError, RawItem, Result, Source, Store, UserId};
use rusqlite::{Connection, OptionalExtension, params};

/// A user's relation to one source. Unsubscribing only clears `is_active`.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub source: Source,
    pub is_active: bool,
    pub added_at: DateTime<Utc>,
    pub last_item_id: Option<i64>,
}

/// SQLite-backed store. The async [`Store`] methods run on the blocking
/// pool; the operator methods are plain synchronous calls.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn db_err(e: rusqlite::Error) -> DigestError {
    DigestError::StoreUnavailable(e.to_string())
}

fn run_locked<T>(
    conn: &Mutex<Connection>,
    f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
) -> Result<T> {
    let conn = conn
        .lock()
        .map_err(|e| DigestError::StoreUnavailable(format!("connection poisoned: {e}")))?;
    f(&conn).map_err(db_err)
}

impl SqliteStore {
    /// Open or create the database file.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        Self::with_connection(conn)
    }

    /// Private in-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(db_err)?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS users (
                user_id INTEGER PRIMARY KEY,
                username TEXT,
                is_active INTEGER NOT NULL DEFAULT 0,
                interval_secs INTEGER,            -- NULL = scheduler default
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sources (
                source_id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,        -- channel handle, no '@'
                display_name TEXT NOT NULL,
                topic TEXT,
                link TEXT NOT NULL
            );

            -- Many-to-many; rows are never deleted, only deactivated
            CREATE TABLE IF NOT EXISTS subscriptions (
                user_id INTEGER NOT NULL,
                source_id INTEGER NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                added_at TEXT NOT NULL,
                last_item_id INTEGER,             -- high-water mark of digested items
                PRIMARY KEY (user_id, source_id),
                FOREIGN KEY (source_id) REFERENCES sources(source_id)
            );

            CREATE TABLE IF NOT EXISTS raw_items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_id INTEGER NOT NULL,
                item_id INTEGER NOT NULL,
                text TEXT NOT NULL,
                captured_at TEXT NOT NULL,
                UNIQUE (source_id, item_id)
            );
            CREATE INDEX IF NOT EXISTS idx_raw_items_captured ON raw_items(captured_at);

            CREATE TABLE IF NOT EXISTS digests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
         ",
            )
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        run_locked(&self.conn, f)
    }

    /// Run `f` on the blocking pool so a slow disk or a held lock never
    /// stalls the async workers, and callers can put a deadline on it.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || run_locked(&conn, f))
            .await
            .map_err(|e| DigestError::StoreUnavailable(format!("store task failed: {e}")))?
    }

    // ─── Operator surface ─────────────────────────────────────

    /// Register a user, or refresh their username.
    pub fn add_user(&self, user_id: UserId, username: Option<&str>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (user_id, username, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET username = COALESCE(excluded.username, users.username)",
                params![user_id, username, ts(Utc::now())],
            )?;
            Ok(())
        })
    }

    pub fn is_user_active(&self, user_id: UserId) -> Result<bool> {
        self.with_conn(|conn| {
            let active: Option<i64> = conn
                .query_row(
                    "SELECT is_active FROM users WHERE user_id = ?1",
                    params![user_id],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(active.unwrap_or(0) != 0)
        })
    }

    /// Subscribe a user to a channel handle, creating the source on first use.
    /// Re-subscribing reactivates the existing row and keeps its history.
    pub fn subscribe(&self, user_id: UserId, handle: &str) -> Result<Source> {
        let name = Source::normalize_handle(handle)
            .ok_or_else(|| DigestError::Other(format!("invalid channel handle: {handle}")))?;
        let now = ts(Utc::now());
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (user_id, created_at) VALUES (?1, ?2) ON CONFLICT(user_id) DO NOTHING",
                params![user_id, now],
            )?;
            conn.execute(
                "INSERT OR IGNORE INTO sources (name, display_name, link) VALUES (?1, ?2, ?3)",
                params![name, format!("@{name}"), Source::link_for(&name)],
            )?;
            let source = conn.query_row(
                "SELECT source_id, name, display_name, topic, link FROM sources WHERE name = ?1",
                params![name],
                row_to_source,
            )?;
            conn.execute(
                "INSERT INTO subscriptions (user_id, source_id, is_active, added_at) VALUES (?1, ?2, 1, ?3)
                 ON CONFLICT(user_id, source_id) DO UPDATE SET is_active = 1",
                params![user_id, source.source_id, now],
            )?;
            Ok(source)
        })
    }

    /// Returns false when the user had no such subscription.
    pub fn unsubscribe(&self, user_id: UserId, handle: &str) -> Result<bool> {
        let Some(name) = Source::normalize_handle(handle) else {
            return Ok(false);
        };
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE subscriptions SET is_active = 0
                 WHERE user_id = ?1 AND source_id = (SELECT source_id FROM sources WHERE name = ?2)",
                params![user_id, name],
            )?;
            Ok(changed > 0)
        })
    }

    /// All subscriptions, active or not, oldest first.
    pub fn list_subscriptions(&self, user_id: UserId) -> Result<Vec<Subscription>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT s.source_id, s.name, s.display_name, s.topic, s.link,
                        sub.is_active, sub.added_at, sub.last_item_id
                 FROM subscriptions sub JOIN sources s ON s.source_id = sub.source_id
                 WHERE sub.user_id = ?1 ORDER BY sub.added_at, s.name",
            )?;
            let rows = stmt.query_map(params![user_id], |row| {
                Ok(Subscription {
                    source: row_to_source(row)?,
                    is_active: row.get::<_, i64>(5)? != 0,
                    added_at: parse_ts(&row.get::<_, String>(6)?),
                    last_item_id: row.get(7)?,
                })
            })?;
            rows.collect()
        })
    }

    /// Most recent digests first.
    pub fn recent_digests(&self, user_id: UserId, limit: usize) -> Result<Vec<Digest>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, content, created_at FROM digests
                 WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![user_id, limit as i64], |row| {
                Ok(Digest {
                    user_id: row.get(0)?,
                    content: row.get(1)?,
                    created_at: parse_ts(&row.get::<_, String>(2)?),
                })
            })?;
            rows.collect()
        })
    }

    pub fn raw_item_count(&self) -> Result<usize> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM raw_items", [], |r| r.get::<_, i64>(0))
                .map(|n| n as usize)
        })
    }
}

fn row_to_source(row: &rusqlite::Row<'_>) -> rusqlite::Result<Source> {
    Ok(Source {
        source_id: row.get(0)?,
        name: row.get(1)?,
        display_name: row.get(2)?,
        topic: row.get(3)?,
        link: row.get(4)?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_active_users(&self) -> Result<Vec<UserId>> {
        self.blocking(|conn| {
            let mut stmt =
                conn.prepare("SELECT user_id FROM users WHERE is_active = 1 ORDER BY user_id")?;
            let rows = stmt.query_map([], |r| r.get(0))?;
            rows.collect()
        })
        .await
    }

    async fn get_user_interval(&self, user_id: UserId) -> Result<Option<Duration>> {
        self.blocking(move |conn| {
            let secs: Option<Option<i64>> = conn
                .query_row(
                    "SELECT interval_secs FROM users WHERE user_id = ?1",
                    params![user_id],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(secs
                .flatten()
                .filter(|s| *s > 0)
                .map(|s| Duration::from_secs(s as u64)))
        })
        .await
    }

    async fn set_user_interval(&self, user_id: UserId, interval: Duration) -> Result<()> {
        // Whole seconds in a positive INTEGER; anything else would read back as unset.
        let secs = i64::try_from(interval.as_secs())
            .ok()
            .filter(|s| *s > 0)
            .ok_or_else(|| {
                DigestError::Config(format!("interval {interval:?} cannot be stored"))
            })?;
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO users (user_id, interval_secs, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET interval_secs = excluded.interval_secs",
                params![user_id, secs, ts(Utc::now())],
            )?;
            Ok(())
        })
        .await
    }

    async fn set_user_active(&self, user_id: UserId, active: bool) -> Result<()> {
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO users (user_id, is_active, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET is_active = excluded.is_active",
                params![user_id, active as i64, ts(Utc::now())],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_active_sources(&self, user_id: UserId) -> Result<Vec<Source>> {
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT s.source_id, s.name, s.display_name, s.topic, s.link
                 FROM subscriptions sub JOIN sources s ON s.source_id = sub.source_id
                 WHERE sub.user_id = ?1 AND sub.is_active = 1
                 ORDER BY sub.added_at, s.name",
            )?;
            let rows = stmt.query_map(params![user_id], row_to_source)?;
            rows.collect()
        })
        .await
    }

    async fn get_checkpoint(&self, user_id: UserId, source_id: i64) -> Result<Option<i64>> {
        self.blocking(move |conn| {
            let mark: Option<Option<i64>> = conn
                .query_row(
                    "SELECT last_item_id FROM subscriptions WHERE user_id = ?1 AND source_id = ?2",
                    params![user_id, source_id],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(mark.flatten())
        })
        .await
    }

    async fn set_checkpoint(&self, user_id: UserId, source_id: i64, item_id: i64) -> Result<()> {
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE subscriptions SET last_item_id = MAX(COALESCE(last_item_id, ?3), ?3)
                 WHERE user_id = ?1 AND source_id = ?2",
                params![user_id, source_id, item_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn save_raw_item(&self, item: &RawItem) -> Result<()> {
        let item = item.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO raw_items (source_id, item_id, text, captured_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![item.source_id, item.item_id, item.text, ts(item.captured_at)],
            )?;
            Ok(())
        })
        .await
    }

    async fn save_digest(&self, digest: &Digest) -> Result<()> {
        let digest = digest.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO digests (user_id, content, created_at) VALUES (?1, ?2, ?3)",
                params![digest.user_id, digest.content, ts(digest.created_at)],
            )?;
            Ok(())
        })
        .await
    }

    async fn prune_raw_items_older_than(&self, age: Duration) -> Result<usize> {
        let age = chrono::Duration::from_std(age).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.blocking(move |conn| {
            conn.execute(
                "DELETE FROM raw_items WHERE captured_at < ?1",
                params![ts(cutoff)],
            )
        })
        .await
    }
}
