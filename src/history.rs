//! Conversation persistence for the HTTP surface
//!
//! Stores per-session chat transcripts in the same SQLite database as the
//! usage counters. The realtime pipeline does not read this store; it exists
//! for the CRUD endpoints.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::types::{Language, PersonaRole, Role};

/// One stored chat message
#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// One conversation session row
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSession {
    pub session_id: String,
    pub user_id: String,
    pub language: Language,
    pub role: Option<PersonaRole>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// SQLite-backed chat history store
pub struct HistoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl HistoryStore {
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
            CREATE TABLE IF NOT EXISTS conversations (
                session_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                language TEXT NOT NULL DEFAULT 'en',
                role TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (session_id) REFERENCES conversations(session_id)
                    ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_conversations_user
                ON conversations(user_id, updated_at DESC);
            CREATE INDEX IF NOT EXISTS idx_messages_session
                ON messages(session_id, created_at);
            "#,
        )?;
        Ok(())
    }

    /// Create the conversation row if missing and bump its updated_at
    pub async fn touch_session(
        &self,
        session_id: &str,
        user_id: &str,
        language: Language,
        role: Option<PersonaRole>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            r#"INSERT INTO conversations (session_id, user_id, language, role, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?5)
               ON CONFLICT(session_id) DO UPDATE SET updated_at = excluded.updated_at"#,
            params![
                session_id,
                user_id,
                language.code(),
                role.map(serde_variant_name),
                now,
            ],
        )?;
        Ok(())
    }

    /// Append one message; returns the message id
    pub async fn append_message(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
    ) -> Result<String> {
        let conn = self.conn.lock().await;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            r#"INSERT INTO messages (id, session_id, role, content, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5)"#,
            params![id, session_id, role.to_openai_string(), content, now],
        )?;
        conn.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE session_id = ?2",
            params![now, session_id],
        )?;
        Ok(id)
    }

    /// Full transcript of one session, oldest first
    pub async fn conversation(&self, session_id: &str) -> Result<Vec<StoredMessage>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"SELECT id, session_id, role, content, created_at
               FROM messages WHERE session_id = ?1 ORDER BY created_at, id"#,
        )?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                let role: String = row.get(2)?;
                let created_at: String = row.get(4)?;
                Ok(StoredMessage {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    role: Role::from_openai_string(&role).unwrap_or(Role::User),
                    content: row.get(3)?,
                    created_at: parse_ts(&created_at),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Sessions belonging to a user, most recent first
    pub async fn list_sessions(&self, user_id: &str) -> Result<Vec<ConversationSession>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"SELECT session_id, user_id, language, role, created_at, updated_at
               FROM conversations WHERE user_id = ?1 ORDER BY updated_at DESC"#,
        )?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                let language: String = row.get(2)?;
                let role: Option<String> = row.get(3)?;
                let created_at: String = row.get(4)?;
                let updated_at: String = row.get(5)?;
                Ok(ConversationSession {
                    session_id: row.get(0)?,
                    user_id: row.get(1)?,
                    language: Language::parse(&language).unwrap_or_default(),
                    role: role.as_deref().and_then(PersonaRole::parse),
                    created_at: parse_ts(&created_at),
                    updated_at: parse_ts(&updated_at),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Delete a session and its messages; returns whether anything existed
    pub async fn delete_session(&self, session_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM messages WHERE session_id = ?1",
            params![session_id],
        )?;
        let deleted = conn.execute(
            "DELETE FROM conversations WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(deleted > 0)
    }

    pub async fn session_exists(&self, session_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM conversations WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn serde_variant_name(role: PersonaRole) -> &'static str {
    match role {
        PersonaRole::LoyalBestFriend => "loyal_best_friend",
        PersonaRole::CaringParent => "caring_parent",
        PersonaRole::Coach => "coach",
        PersonaRole::FunnyFriend => "funny_friend",
    }
}
