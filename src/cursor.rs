// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Feed cursor persistence.
//!
//! Stores the position of the last applied change event for each feed kind
//! in SQLite, so a restarted engine can resume the feed instead of starting
//! from the position captured before the initial import.
//!
//! # Debounced Writes
//!
//! - `set_position()` updates the in-memory cache and marks the feed dirty
//! - `flush_dirty()` persists every dirty feed in one pass
//! - The engine flushes on an interval and once more on shutdown
//!
//! A crash between `set_position()` and `flush_dirty()` loses at most one
//! flush interval of progress. Replaying those events is harmless: inserts
//! and replacements are upserts, and deletes of missing rows affect nothing.
//!
//! # Cursor Semantics
//!
//! ```text
//! read event → apply to target → set_position(event)
//!                                (crash here = event re-applied)
//! ```
//!
//! On restart the feed resumes strictly after the stored position.
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY / SQLITE_LOCKED are retried with exponential backoff.

use crate::config::{CursorConfig, FeedKind};
use crate::error::{ReplicationError, Result};
use crate::feed::FeedPosition;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// SQLITE_BUSY (5) or SQLITE_LOCKED (6).
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::cursor_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(operation = operation_name, attempts, "SQLite busy, max retries exceeded");
                }
                return Err(e);
            }
        }
    }
}

/// Persistent feed cursor storage backed by SQLite.
pub struct FeedCursorStore {
    pool: SqlitePool,
    /// Encoded positions by feed name.
    cache: Arc<RwLock<HashMap<String, String>>>,
    dirty: Arc<RwLock<HashSet<String>>>,
    path: String,
    wal_mode: bool,
}

impl FeedCursorStore {
    /// Open the store described by `config`. `":memory:"` keeps cursors for
    /// the lifetime of the process only.
    pub async fn open(config: &CursorConfig) -> Result<Self> {
        if config.sqlite_path == ":memory:" {
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?;
            // Every connection to :memory: is a separate database.
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(options)
                .await?;
            return Self::with_pool(pool, ":memory:".to_string(), false).await;
        }
        Self::connect(&config.sqlite_path, config.wal_mode).await
    }

    /// Open (or create) a WAL-mode store at `path`.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::connect(&path.as_ref().to_string_lossy(), true).await
    }

    async fn connect(path: &str, wal_mode: bool) -> Result<Self> {
        info!(path = %path, wal_mode, "Initializing feed cursor store");

        let journal = if wal_mode { SqliteJournalMode::Wal } else { SqliteJournalMode::Delete };
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path))
            .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(journal)
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;
        Self::with_pool(pool, path.to_string(), wal_mode).await
    }

    async fn with_pool(pool: SqlitePool, path: String, wal_mode: bool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_cursors (
                feed TEXT PRIMARY KEY,
                position TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, String)> = sqlx::query_as("SELECT feed, position FROM feed_cursors")
            .fetch_all(&pool)
            .await?;

        let mut cache = HashMap::new();
        for (feed, position) in rows {
            debug!(feed = %feed, position = %position, "Loaded feed cursor from disk");
            cache.insert(feed, position);
        }
        if !cache.is_empty() {
            info!(count = cache.len(), "Restored feed cursors from previous run");
        }

        Ok(Self {
            pool,
            cache: Arc::new(RwLock::new(cache)),
            dirty: Arc::new(RwLock::new(HashSet::new())),
            path,
            wal_mode,
        })
    }

    /// Raw encoded position for a feed.
    pub async fn get(&self, feed: &str) -> Option<String> {
        self.cache.read().await.get(feed).cloned()
    }

    /// Store a raw encoded position (debounced).
    pub async fn set(&self, feed: &str, position: &str) {
        self.cache
            .write()
            .await
            .insert(feed.to_string(), position.to_string());
        self.dirty.write().await.insert(feed.to_string());
        debug!(feed = %feed, position = %position, "Feed cursor updated (pending flush)");
    }

    /// Last applied position of a feed kind.
    ///
    /// A stored cursor that no longer decodes is an error: silently starting
    /// over would skip every change since the cursor was written.
    pub async fn get_position(&self, kind: FeedKind) -> Result<Option<FeedPosition>> {
        match self.get(kind.as_str()).await {
            Some(encoded) => FeedPosition::decode(&encoded).map(Some),
            None => Ok(None),
        }
    }

    pub async fn set_position(&self, position: &FeedPosition) -> Result<()> {
        let encoded = position.encode()?;
        self.set(position.kind().as_str(), &encoded).await;
        Ok(())
    }

    /// Persist every dirty cursor. Returns how many were written.
    pub async fn flush_dirty(&self) -> Result<usize> {
        let dirty_feeds: Vec<String> = self.dirty.write().await.drain().collect();
        if dirty_feeds.is_empty() {
            return Ok(0);
        }

        let now = chrono::Utc::now().timestamp_millis();
        let cache = self.cache.read().await;
        let pool = &self.pool;

        let mut flushed = 0;
        let mut errors = 0;

        for feed in &dirty_feeds {
            let Some(position) = cache.get(feed) else { continue };
            let result = execute_with_retry("cursor_flush", || async {
                sqlx::query(
                    r#"
                    INSERT INTO feed_cursors (feed, position, updated_at)
                    VALUES (?, ?, ?)
                    ON CONFLICT(feed) DO UPDATE SET
                        position = excluded.position,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(feed)
                .bind(position)
                .bind(now)
                .execute(pool)
                .await
            })
            .await;

            match result {
                Ok(_) => flushed += 1,
                Err(e) => {
                    errors += 1;
                    warn!(feed = %feed, error = %e, "Failed to flush feed cursor");
                    self.dirty.write().await.insert(feed.clone());
                }
            }
        }

        if flushed > 0 || errors > 0 {
            debug!(flushed, errors, "Flushed dirty feed cursors");
            crate::metrics::record_cursor_flush(flushed, errors);
        }
        if errors > 0 {
            return Err(ReplicationError::Internal(format!(
                "Failed to flush {} feed cursors",
                errors
            )));
        }
        Ok(flushed)
    }

    pub async fn has_dirty(&self) -> bool {
        !self.dirty.read().await.is_empty()
    }

    pub async fn dirty_count(&self) -> usize {
        self.dirty.read().await.len()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Fold the WAL into the main database file. No-op outside WAL mode.
    pub async fn checkpoint(&self) -> Result<()> {
        if !self.wal_mode {
            return Ok(());
        }
        let pool = &self.pool;
        execute_with_retry("cursor_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Flush, checkpoint and close the pool.
    pub async fn close(&self) {
        if self.has_dirty().await {
            match self.flush_dirty().await {
                Ok(count) if count > 0 => info!(count, "Flushed dirty feed cursors on close"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to flush dirty feed cursors on close"),
            }
        }
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Feed cursor store closed");
    }
}
