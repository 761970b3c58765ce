//! Persistent storage for voice usage counters and audit events
//!
//! The [`UsageStore`] trait is the persistence contract consumed by the
//! tracker and the admin endpoints. Every operation is a single atomic
//! statement (or upsert-increment), so retries are idempotent at the
//! logical-operation level. The SQLite implementation keeps the connection
//! behind a tokio mutex and runs in WAL mode.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::models::{
    day_key, month_key, AbuseEventType, LimitKind, UsageSummary, VoiceAbuseEvent,
    VoiceLimitEvent, VoiceUsageDaily, VoiceUsageMonthly, VoiceUsageSession,
};

/// Typed store errors; the tracker treats all of these as non-fatal
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session {0} is not active")]
    NotActive(String),
    #[error("no record found for {0}")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Per-user rollup used by the management endpoints
#[derive(Debug, Clone, serde::Serialize)]
pub struct UserUsageOverview {
    pub user_id: String,
    pub daily_duration_ms: u64,
    pub monthly_duration_ms: u64,
    pub session_count_today: u64,
    pub limit_reached_count_today: u64,
}

/// Persistence contract for voice usage accounting
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Insert the session row; unique on session id, idempotent under retry
    async fn create_session(&self, session_id: &str, user_id: &str) -> Result<(), StoreError>;

    /// Atomic increment on the active session; returns the post-update row
    async fn update_session_usage(
        &self,
        session_id: &str,
        duration_ms: u64,
        chunk_count: u64,
    ) -> Result<VoiceUsageSession, StoreError>;

    async fn end_session(&self, session_id: &str) -> Result<(), StoreError>;

    async fn mark_session_limit_reached(
        &self,
        session_id: &str,
        kind: LimitKind,
    ) -> Result<(), StoreError>;

    /// Upsert-increment the daily rollup; missing fields initialized on insert
    async fn upsert_daily(
        &self,
        user_id: &str,
        date: NaiveDate,
        duration_ms: u64,
        chunk_count: u64,
    ) -> Result<(), StoreError>;

    /// Upsert-increment the monthly rollup
    async fn upsert_monthly(
        &self,
        user_id: &str,
        year_month: &str,
        duration_ms: u64,
    ) -> Result<(), StoreError>;

    async fn increment_daily_session_count(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<(), StoreError>;

    async fn increment_daily_limit_reached(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<(), StoreError>;

    async fn increment_monthly_session_count(
        &self,
        user_id: &str,
        year_month: &str,
    ) -> Result<(), StoreError>;

    async fn record_limit_event(&self, event: VoiceLimitEvent) -> Result<(), StoreError>;

    async fn record_abuse_event(&self, event: VoiceAbuseEvent) -> Result<(), StoreError>;

    /// One logical snapshot of session/day/month durations; tolerates being
    /// stale by one in-flight write
    async fn usage_summary(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<UsageSummary, StoreError>;

    /// Sessions started by the user within the trailing window
    async fn recent_session_count(
        &self,
        user_id: &str,
        window: Duration,
    ) -> Result<u64, StoreError>;

    /// Zero the current day and month rollups; history is untouched
    async fn reset_user(&self, user_id: &str) -> Result<(), StoreError>;

    async fn get_session(&self, session_id: &str)
        -> Result<Option<VoiceUsageSession>, StoreError>;

    async fn list_user_sessions(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<VoiceUsageSession>, StoreError>;

    async fn daily_history(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<VoiceUsageDaily>, StoreError>;

    async fn monthly_history(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<VoiceUsageMonthly>, StoreError>;

    /// Today's rollups for every user with recorded usage
    async fn all_user_overviews(&self) -> Result<Vec<UserUsageOverview>, StoreError>;

    /// Maintenance sweep: delete inactive session rows older than `days`.
    /// Daily and monthly rollups are never deleted.
    async fn archive_sessions_older_than(&self, days: u32) -> Result<u64, StoreError>;
}

/// SQLite-backed implementation of [`UsageStore`]
pub struct SqliteUsageStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteUsageStore {
    /// Open (or create) the store at the given path
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store, used by tests and ephemeral deployments
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS voice_usage_sessions (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL UNIQUE,
                user_id TEXT NOT NULL,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                chunk_count INTEGER NOT NULL DEFAULT 0,
                started_at TEXT NOT NULL,
                last_activity_at TEXT NOT NULL,
                ended_at TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                voice_disabled INTEGER NOT NULL DEFAULT 0,
                limit_reached TEXT
            );

            CREATE TABLE IF NOT EXISTS voice_usage_daily (
                user_id TEXT NOT NULL,
                date TEXT NOT NULL,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                session_count INTEGER NOT NULL DEFAULT 0,
                chunk_count INTEGER NOT NULL DEFAULT 0,
                limit_reached_count INTEGER NOT NULL DEFAULT 0,
                UNIQUE(user_id, date)
            );

            CREATE TABLE IF NOT EXISTS voice_usage_monthly (
                user_id TEXT NOT NULL,
                year_month TEXT NOT NULL,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                session_count INTEGER NOT NULL DEFAULT 0,
                UNIQUE(user_id, year_month)
            );

            CREATE TABLE IF NOT EXISTS voice_limit_events (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                limit_type TEXT NOT NULL,
                limit_minutes REAL NOT NULL,
                used_minutes REAL NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS voice_abuse_events (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                details TEXT NOT NULL,
                reviewed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_usage_sessions_user_started
                ON voice_usage_sessions(user_id, started_at DESC);
            CREATE INDEX IF NOT EXISTS idx_limit_events_user
                ON voice_limit_events(user_id, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_abuse_events_user
                ON voice_abuse_events(user_id, created_at DESC);
            "#,
        )?;
        Ok(())
    }

    fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<VoiceUsageSession> {
        let started_at: String = row.get("started_at")?;
        let last_activity_at: String = row.get("last_activity_at")?;
        let ended_at: Option<String> = row.get("ended_at")?;
        let limit_reached: Option<String> = row.get("limit_reached")?;
        Ok(VoiceUsageSession {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            user_id: row.get("user_id")?,
            duration_ms: row.get::<_, i64>("duration_ms")? as u64,
            chunk_count: row.get::<_, i64>("chunk_count")? as u64,
            started_at: parse_ts(&started_at),
            last_activity_at: parse_ts(&last_activity_at),
            ended_at: ended_at.as_deref().map(parse_ts),
            is_active: row.get::<_, i64>("is_active")? != 0,
            voice_disabled: row.get::<_, i64>("voice_disabled")? != 0,
            limit_reached: limit_reached.as_deref().and_then(LimitKind::parse),
        })
    }
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl UsageStore for SqliteUsageStore {
    async fn create_session(&self, session_id: &str, user_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            r#"INSERT OR IGNORE INTO voice_usage_sessions
               (id, session_id, user_id, started_at, last_activity_at)
               VALUES (?1, ?2, ?3, ?4, ?4)"#,
            params![Uuid::new_v4().to_string(), session_id, user_id, now],
        )?;
        Ok(())
    }

    async fn update_session_usage(
        &self,
        session_id: &str,
        duration_ms: u64,
        chunk_count: u64,
    ) -> Result<VoiceUsageSession, StoreError> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let changed = conn.execute(
            r#"UPDATE voice_usage_sessions
               SET duration_ms = duration_ms + ?1,
                   chunk_count = chunk_count + ?2,
                   last_activity_at = ?3
               WHERE session_id = ?4 AND is_active = 1"#,
            params![duration_ms as i64, chunk_count as i64, now, session_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotActive(session_id.to_string()));
        }
        let session = conn
            .query_row(
                "SELECT * FROM voice_usage_sessions WHERE session_id = ?1",
                params![session_id],
                Self::row_to_session,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        Ok(session)
    }

    async fn end_session(&self, session_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            r#"UPDATE voice_usage_sessions
               SET is_active = 0, ended_at = COALESCE(ended_at, ?1)
               WHERE session_id = ?2"#,
            params![now, session_id],
        )?;
        Ok(())
    }

    async fn mark_session_limit_reached(
        &self,
        session_id: &str,
        kind: LimitKind,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"UPDATE voice_usage_sessions
               SET voice_disabled = 1, limit_reached = ?1
               WHERE session_id = ?2"#,
            params![kind.as_str(), session_id],
        )?;
        Ok(())
    }

    async fn upsert_daily(
        &self,
        user_id: &str,
        date: NaiveDate,
        duration_ms: u64,
        chunk_count: u64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO voice_usage_daily (user_id, date, duration_ms, chunk_count)
               VALUES (?1, ?2, ?3, ?4)
               ON CONFLICT(user_id, date) DO UPDATE SET
                   duration_ms = duration_ms + excluded.duration_ms,
                   chunk_count = chunk_count + excluded.chunk_count"#,
            params![
                user_id,
                date.to_string(),
                duration_ms as i64,
                chunk_count as i64
            ],
        )?;
        Ok(())
    }

    async fn upsert_monthly(
        &self,
        user_id: &str,
        year_month: &str,
        duration_ms: u64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO voice_usage_monthly (user_id, year_month, duration_ms)
               VALUES (?1, ?2, ?3)
               ON CONFLICT(user_id, year_month) DO UPDATE SET
                   duration_ms = duration_ms + excluded.duration_ms"#,
            params![user_id, year_month, duration_ms as i64],
        )?;
        Ok(())
    }

    async fn increment_daily_session_count(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO voice_usage_daily (user_id, date, session_count)
               VALUES (?1, ?2, 1)
               ON CONFLICT(user_id, date) DO UPDATE SET
                   session_count = session_count + 1"#,
            params![user_id, date.to_string()],
        )?;
        Ok(())
    }

    async fn increment_daily_limit_reached(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO voice_usage_daily (user_id, date, limit_reached_count)
               VALUES (?1, ?2, 1)
               ON CONFLICT(user_id, date) DO UPDATE SET
                   limit_reached_count = limit_reached_count + 1"#,
            params![user_id, date.to_string()],
        )?;
        Ok(())
    }

    async fn increment_monthly_session_count(
        &self,
        user_id: &str,
        year_month: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO voice_usage_monthly (user_id, year_month, session_count)
               VALUES (?1, ?2, 1)
               ON CONFLICT(user_id, year_month) DO UPDATE SET
                   session_count = session_count + 1"#,
            params![user_id, year_month],
        )?;
        Ok(())
    }

    async fn record_limit_event(&self, event: VoiceLimitEvent) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT OR IGNORE INTO voice_limit_events
               (id, user_id, session_id, limit_type, limit_minutes, used_minutes, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
            params![
                event.id,
                event.user_id,
                event.session_id,
                event.limit_type.as_str(),
                event.limit_minutes,
                event.used_minutes,
                event.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn record_abuse_event(&self, event: VoiceAbuseEvent) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT OR IGNORE INTO voice_abuse_events
               (id, user_id, session_id, event_type, details, reviewed, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
            params![
                event.id,
                event.user_id,
                event.session_id,
                event.event_type.as_str(),
                event.details.to_string(),
                event.reviewed as i64,
                event.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn usage_summary(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<UsageSummary, StoreError> {
        let conn = self.conn.lock().await;
        let now = Utc::now();

        let session: Option<VoiceUsageSession> = conn
            .query_row(
                "SELECT * FROM voice_usage_sessions WHERE session_id = ?1",
                params![session_id],
                Self::row_to_session,
            )
            .optional()?;

        let daily_ms: i64 = conn
            .query_row(
                "SELECT duration_ms FROM voice_usage_daily WHERE user_id = ?1 AND date = ?2",
                params![user_id, day_key(now).to_string()],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);

        let monthly_ms: i64 = conn
            .query_row(
                "SELECT duration_ms FROM voice_usage_monthly WHERE user_id = ?1 AND year_month = ?2",
                params![user_id, month_key(now)],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);

        Ok(UsageSummary {
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            session_duration_ms: session.as_ref().map(|s| s.duration_ms).unwrap_or(0),
            daily_duration_ms: daily_ms as u64,
            monthly_duration_ms: monthly_ms as u64,
            voice_enabled: session.as_ref().map(|s| !s.voice_disabled).unwrap_or(true),
            limit_reached: session.as_ref().and_then(|s| s.limit_reached),
        })
    }

    async fn recent_session_count(
        &self,
        user_id: &str,
        window: Duration,
    ) -> Result<u64, StoreError> {
        let conn = self.conn.lock().await;
        let cutoff = (Utc::now() - window).to_rfc3339();
        let count: i64 = conn.query_row(
            r#"SELECT COUNT(*) FROM voice_usage_sessions
               WHERE user_id = ?1 AND started_at >= ?2"#,
            params![user_id, cutoff],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    async fn reset_user(&self, user_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let now = Utc::now();
        conn.execute(
            "UPDATE voice_usage_daily SET duration_ms = 0 WHERE user_id = ?1 AND date = ?2",
            params![user_id, day_key(now).to_string()],
        )?;
        conn.execute(
            "UPDATE voice_usage_monthly SET duration_ms = 0 WHERE user_id = ?1 AND year_month = ?2",
            params![user_id, month_key(now)],
        )?;
        Ok(())
    }

    async fn get_session(
        &self,
        session_id: &str,
    ) -> Result<Option<VoiceUsageSession>, StoreError> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT * FROM voice_usage_sessions WHERE session_id = ?1",
                params![session_id],
                Self::row_to_session,
            )
            .optional()?)
    }

    async fn list_user_sessions(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<VoiceUsageSession>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"SELECT * FROM voice_usage_sessions
               WHERE user_id = ?1 ORDER BY started_at DESC LIMIT ?2"#,
        )?;
        let rows = stmt
            .query_map(params![user_id, limit as i64], Self::row_to_session)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn daily_history(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<VoiceUsageDaily>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"SELECT user_id, date, duration_ms, session_count, chunk_count, limit_reached_count
               FROM voice_usage_daily WHERE user_id = ?1 ORDER BY date DESC LIMIT ?2"#,
        )?;
        let rows = stmt
            .query_map(params![user_id, limit as i64], |row| {
                let date: String = row.get(1)?;
                Ok(VoiceUsageDaily {
                    user_id: row.get(0)?,
                    date: date.parse().unwrap_or_else(|_| Utc::now().date_naive()),
                    duration_ms: row.get::<_, i64>(2)? as u64,
                    session_count: row.get::<_, i64>(3)? as u64,
                    chunk_count: row.get::<_, i64>(4)? as u64,
                    limit_reached_count: row.get::<_, i64>(5)? as u64,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn monthly_history(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<VoiceUsageMonthly>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"SELECT user_id, year_month, duration_ms, session_count
               FROM voice_usage_monthly WHERE user_id = ?1 ORDER BY year_month DESC LIMIT ?2"#,
        )?;
        let rows = stmt
            .query_map(params![user_id, limit as i64], |row| {
                Ok(VoiceUsageMonthly {
                    user_id: row.get(0)?,
                    year_month: row.get(1)?,
                    duration_ms: row.get::<_, i64>(2)? as u64,
                    session_count: row.get::<_, i64>(3)? as u64,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn all_user_overviews(&self) -> Result<Vec<UserUsageOverview>, StoreError> {
        let conn = self.conn.lock().await;
        let now = Utc::now();
        let mut stmt = conn.prepare(
            r#"SELECT d.user_id, d.duration_ms, d.session_count, d.limit_reached_count,
                      COALESCE(m.duration_ms, 0)
               FROM voice_usage_daily d
               LEFT JOIN voice_usage_monthly m
                   ON m.user_id = d.user_id AND m.year_month = ?2
               WHERE d.date = ?1
               ORDER BY d.duration_ms DESC"#,
        )?;
        let rows = stmt
            .query_map(params![day_key(now).to_string(), month_key(now)], |row| {
                Ok(UserUsageOverview {
                    user_id: row.get(0)?,
                    daily_duration_ms: row.get::<_, i64>(1)? as u64,
                    session_count_today: row.get::<_, i64>(2)? as u64,
                    limit_reached_count_today: row.get::<_, i64>(3)? as u64,
                    monthly_duration_ms: row.get::<_, i64>(4)? as u64,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn archive_sessions_older_than(&self, days: u32) -> Result<u64, StoreError> {
        let conn = self.conn.lock().await;
        let cutoff = (Utc::now() - Duration::days(days as i64)).to_rfc3339();
        let deleted = conn.execute(
            "DELETE FROM voice_usage_sessions WHERE is_active = 0 AND started_at < ?1",
            params![cutoff],
        )?;
        Ok(deleted as u64)
    }
}

/// Build an abuse event with a fresh id and timestamp
pub fn new_abuse_event(
    user_id: &str,
    session_id: &str,
    event_type: AbuseEventType,
    details: serde_json::Value,
) -> VoiceAbuseEvent {
    VoiceAbuseEvent {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        session_id: session_id.to_string(),
        event_type,
        details,
        reviewed: false,
        created_at: Utc::now(),
    }
}

/// Build a limit event with a fresh id and timestamp
pub fn new_limit_event(
    user_id: &str,
    session_id: &str,
    limit_type: LimitKind,
    limit_minutes: f64,
    used_minutes: f64,
) -> VoiceLimitEvent {
    VoiceLimitEvent {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        session_id: session_id.to_string(),
        limit_type,
        limit_minutes,
        used_minutes,
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteUsageStore {
        SqliteUsageStore::in_memory().unwrap()
    }

    #[tokio::test]
    async fn test_create_session_is_idempotent() {
        let store = store().await;
        store.create_session("s1", "u1").await.unwrap();
        store.create_session("s1", "u1").await.unwrap();
        let session = store.get_session("s1").await.unwrap().unwrap();
        assert!(session.is_active);
        assert_eq!(session.duration_ms, 0);
    }

    #[tokio::test]
    async fn test_update_session_usage_increments_and_returns_row() {
        let store = store().await;
        store.create_session("s1", "u1").await.unwrap();
        let row = store.update_session_usage("s1", 128, 1).await.unwrap();
        assert_eq!(row.duration_ms, 128);
        assert_eq!(row.chunk_count, 1);
        let row = store.update_session_usage("s1", 72, 2).await.unwrap();
        assert_eq!(row.duration_ms, 200);
        assert_eq!(row.chunk_count, 3);
    }

    #[tokio::test]
    async fn test_update_after_end_fails_not_active() {
        let store = store().await;
        store.create_session("s1", "u1").await.unwrap();
        store.end_session("s1").await.unwrap();
        let err = store.update_session_usage("s1", 10, 1).await.unwrap_err();
        assert!(matches!(err, StoreError::NotActive(_)));
    }

    #[tokio::test]
    async fn test_daily_upsert_initializes_then_increments() {
        let store = store().await;
        let date = Utc::now().date_naive();
        store.upsert_daily("u1", date, 100, 1).await.unwrap();
        store.upsert_daily("u1", date, 50, 2).await.unwrap();
        let history = store.daily_history("u1", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].duration_ms, 150);
        assert_eq!(history[0].chunk_count, 3);
    }

    #[tokio::test]
    async fn test_summary_reads_all_periods() {
        let store = store().await;
        let now = Utc::now();
        store.create_session("s1", "u1").await.unwrap();
        store.update_session_usage("s1", 128, 1).await.unwrap();
        store.upsert_daily("u1", day_key(now), 128, 1).await.unwrap();
        store.upsert_monthly("u1", &month_key(now), 128).await.unwrap();

        let summary = store.usage_summary("u1", "s1").await.unwrap();
        assert_eq!(summary.session_duration_ms, 128);
        assert_eq!(summary.daily_duration_ms, 128);
        assert_eq!(summary.monthly_duration_ms, 128);
        assert!(summary.voice_enabled);
    }

    #[tokio::test]
    async fn test_mark_limit_reached_persists() {
        let store = store().await;
        store.create_session("s1", "u1").await.unwrap();
        store
            .mark_session_limit_reached("s1", LimitKind::Daily)
            .await
            .unwrap();
        let session = store.get_session("s1").await.unwrap().unwrap();
        assert!(session.voice_disabled);
        assert_eq!(session.limit_reached, Some(LimitKind::Daily));

        let summary = store.usage_summary("u1", "s1").await.unwrap();
        assert!(!summary.voice_enabled);
    }

    #[tokio::test]
    async fn test_recent_session_count_windows() {
        let store = store().await;
        for i in 0..11 {
            store
                .create_session(&format!("s{}", i), "u1")
                .await
                .unwrap();
        }
        let count = store
            .recent_session_count("u1", Duration::seconds(300))
            .await
            .unwrap();
        assert_eq!(count, 11);
        let other = store
            .recent_session_count("u2", Duration::seconds(300))
            .await
            .unwrap();
        assert_eq!(other, 0);
    }

    #[tokio::test]
    async fn test_reset_user_zeroes_current_periods_only() {
        let store = store().await;
        let now = Utc::now();
        store.upsert_daily("u1", day_key(now), 5_000, 3).await.unwrap();
        store.upsert_monthly("u1", &month_key(now), 5_000).await.unwrap();
        store.reset_user("u1").await.unwrap();

        let daily = store.daily_history("u1", 10).await.unwrap();
        assert_eq!(daily[0].duration_ms, 0);
        // Counts other than duration survive a reset
        assert_eq!(daily[0].chunk_count, 3);
        let monthly = store.monthly_history("u1", 10).await.unwrap();
        assert_eq!(monthly[0].duration_ms, 0);
    }

    #[tokio::test]
    async fn test_archive_only_touches_inactive_sessions() {
        let store = store().await;
        store.create_session("old", "u1").await.unwrap();
        store.create_session("live", "u1").await.unwrap();
        store.end_session("old").await.unwrap();
        // Nothing old enough yet
        assert_eq!(store.archive_sessions_older_than(1).await.unwrap(), 0);
        // Zero-day cutoff sweeps the ended session but not the active one
        assert_eq!(store.archive_sessions_older_than(0).await.unwrap(), 1);
        assert!(store.get_session("live").await.unwrap().is_some());
        assert!(store.get_session("old").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_abuse_and_limit_events_append() {
        let store = store().await;
        store
            .record_abuse_event(new_abuse_event(
                "u1",
                "s1",
                AbuseEventType::RapidReconnection,
                serde_json::json!({"session_count": 11}),
            ))
            .await
            .unwrap();
        store
            .record_limit_event(new_limit_event("u1", "s1", LimitKind::Session, 1.0, 1.1))
            .await
            .unwrap();
    }
}
