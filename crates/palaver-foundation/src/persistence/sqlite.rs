//! SQLite 存储后端
//!
//! 提供基于 SQLite 的持久化实现，适用于轻量级部署和本地存储

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use palaver_kernel::conversation::{Message, Role, Session};
use palaver_kernel::store::{ConversationStore, StoreError, StoreResult};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use std::sync::Arc;

/// SQLite 存储
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        Self::connect_with_options(database_url, 5).await
    }

    /// 内存数据库只能使用单连接，否则每个连接各自拥有独立的库
    pub async fn in_memory() -> StoreResult<Self> {
        Self::connect_with_options("sqlite::memory:", 1).await
    }

    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
    ) -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn shared(database_url: &str) -> StoreResult<Arc<Self>> {
        Ok(Arc::new(Self::connect(database_url).await?))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chat_session (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chat_message (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_chat_message_session ON chat_message(session_id, created_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_chat_session_user ON chat_session(user_id, created_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(())
    }

    /// 固定微秒精度的 RFC 3339，保证按字符串排序即按时间排序
    fn encode_time(time: &DateTime<Utc>) -> String {
        time.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    fn decode_time(raw: &str) -> StoreResult<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn parse_message_row(row: &SqliteRow) -> StoreResult<Message> {
        let role_str: String = row
            .try_get("role")
            .map_err(|e| StoreError::Query(e.to_string()))?;
        let role: Role = role_str.parse().map_err(StoreError::Serialization)?;

        let created_at: String = row
            .try_get("created_at")
            .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(Message {
            id: row
                .try_get("id")
                .map_err(|e| StoreError::Query(e.to_string()))?,
            session_id: row
                .try_get("session_id")
                .map_err(|e| StoreError::Query(e.to_string()))?,
            user_id: row
                .try_get("user_id")
                .map_err(|e| StoreError::Query(e.to_string()))?,
            role,
            content: row
                .try_get("content")
                .map_err(|e| StoreError::Query(e.to_string()))?,
            created_at: Self::decode_time(&created_at)?,
        })
    }

    fn parse_session_row(row: &SqliteRow) -> StoreResult<Session> {
        let created_at: String = row
            .try_get("created_at")
            .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(Session {
            id: row
                .try_get("id")
                .map_err(|e| StoreError::Query(e.to_string()))?,
            user_id: row
                .try_get("user_id")
                .map_err(|e| StoreError::Query(e.to_string()))?,
            title: row
                .try_get("title")
                .map_err(|e| StoreError::Query(e.to_string()))?,
            created_at: Self::decode_time(&created_at)?,
        })
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    fn backend_name(&self) -> &str {
        "sqlite"
    }

    async fn save_message(&self, message: &Message) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chat_message (id, session_id, user_id, role, content, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO NOTHING
        "#,
        )
        .bind(&message.id)
        .bind(&message.session_id)
        .bind(&message.user_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(Self::encode_time(&message.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(())
    }

    async fn save_session(&self, session: &Session) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chat_session (id, user_id, title, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET title = excluded.title
        "#,
        )
        .bind(&session.id)
        .bind(&session.user_id)
        .bind(&session.title)
        .bind(Self::encode_time(&session.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_message(&self, id: &str) -> StoreResult<Option<Message>> {
        let row = sqlx::query("SELECT * FROM chat_message WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        row.as_ref().map(Self::parse_message_row).transpose()
    }

    async fn get_session(&self, id: &str) -> StoreResult<Option<Session>> {
        let row = sqlx::query("SELECT * FROM chat_session WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        row.as_ref().map(Self::parse_session_row).transpose()
    }

    async fn get_session_messages(
        &self,
        session_id: &str,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM chat_message WHERE session_id = ? ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?",
        )
        .bind(session_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        rows.iter().map(Self::parse_message_row).collect()
    }

    async fn get_sessions(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<Session>> {
        let rows = sqlx::query(
            "SELECT * FROM chat_session WHERE user_id = ? ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?",
        )
        .bind(user_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        rows.iter().map(Self::parse_session_row).collect()
    }

    async fn delete_message(&self, _session_id: &str, message_id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM chat_message WHERE id = ?")
            .bind(message_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(())
    }

    async fn delete_session(&self, _user_id: &str, session_id: &str) -> StoreResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        sqlx::query("DELETE FROM chat_message WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        sqlx::query("DELETE FROM chat_session WHERE id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(())
    }
}
