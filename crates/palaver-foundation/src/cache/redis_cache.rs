//! Redis 缓存实现
//! Redis cache implementation

use super::{CacheKeys, CacheTtl};
use async_trait::async_trait;
use palaver_kernel::conversation::{Message, Session};
use palaver_kernel::store::{ConversationStore, StoreError, StoreResult};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

/// Redis 缓存层
/// Redis cache tier
///
/// 实现 [`ConversationStore`]，由仓储层作为读穿/写穿缓存使用。
/// Implements [`ConversationStore`]; the repository uses it as the read-through
/// and write-through tier in front of the relational store.
///
/// 分页读取时跳过已过期或无法解码的条目。
/// Paged reads skip index members whose entry expired or fails to decode.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    ttl: CacheTtl,
}

pub(crate) fn redis_err(err: redis::RedisError) -> StoreError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
        StoreError::Connection(err.to_string())
    } else {
        StoreError::Query(err.to_string())
    }
}

fn decode<T: DeserializeOwned>(raw: &str) -> StoreResult<T> {
    serde_json::from_str(raw).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn encode<T: serde::Serialize>(value: &T) -> StoreResult<String> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn score(time: &chrono::DateTime<chrono::Utc>) -> f64 {
    time.timestamp_micros() as f64
}

/// ZREVRANGE 的闭区间
/// Inclusive ZREVRANGE bounds for a page
fn page_bounds(limit: usize, offset: usize) -> (isize, isize) {
    let start = offset as isize;
    (start, start + limit as isize - 1)
}

impl RedisCache {
    /// 连接 Redis 并检测连通性
    /// Connect and ping
    pub async fn connect(url: &str, ttl: CacheTtl) -> StoreResult<Self> {
        let client = redis::Client::open(url).map_err(redis_err)?;
        let mut conn = ConnectionManager::new(client).await.map_err(redis_err)?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(Self { conn, ttl })
    }

    /// 复用已有连接
    /// Reuse an existing connection manager
    pub fn from_manager(conn: ConnectionManager, ttl: CacheTtl) -> Self {
        Self { conn, ttl }
    }

    pub fn ttl(&self) -> &CacheTtl {
        &self.ttl
    }

    /// 按索引页读取并批量水合
    /// Read one page of an index and hydrate it with MGET
    async fn hydrate_page<T: DeserializeOwned>(
        &self,
        index_key: &str,
        entity_key: fn(&str) -> String,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<T>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let (start, stop) = page_bounds(limit, offset);
        let ids: Vec<String> = conn
            .zrevrange(index_key, start, stop)
            .await
            .map_err(redis_err)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids.iter().map(|id| entity_key(id)).collect();
        let raw: Vec<Option<String>> = conn.mget(&keys).await.map_err(redis_err)?;

        let mut items = Vec::with_capacity(raw.len());
        for (id, entry) in ids.iter().zip(raw) {
            let Some(json) = entry else {
                debug!(index = index_key, id = %id, "skipping expired cache entry");
                continue;
            };
            match decode(&json) {
                Ok(item) => items.push(item),
                Err(e) => warn!(index = index_key, id = %id, "skipping undecodable cache entry: {e}"),
            }
        }
        Ok(items)
    }
}

#[async_trait]
impl ConversationStore for RedisCache {
    fn backend_name(&self) -> &str {
        "redis"
    }

    async fn save_message(&self, message: &Message) -> StoreResult<()> {
        let payload = encode(message)?;
        let index = CacheKeys::session_messages(&message.session_id);
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .set_ex(CacheKeys::message(&message.id), payload, self.ttl.message.as_secs())
            .ignore()
            .zadd(&index, &message.id, score(&message.created_at))
            .ignore()
            .expire(&index, self.ttl.session_index.as_secs() as i64)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(redis_err)
    }

    async fn save_session(&self, session: &Session) -> StoreResult<()> {
        let payload = encode(session)?;
        let index = CacheKeys::user_sessions(&session.user_id);
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .set_ex(CacheKeys::session(&session.id), payload, self.ttl.session.as_secs())
            .ignore()
            .zadd(&index, &session.id, score(&session.created_at))
            .ignore()
            .expire(&index, self.ttl.user_index.as_secs() as i64)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(redis_err)
    }

    async fn get_message(&self, id: &str) -> StoreResult<Option<Message>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(CacheKeys::message(id)).await.map_err(redis_err)?;
        raw.as_deref().map(decode).transpose()
    }

    async fn get_session(&self, id: &str) -> StoreResult<Option<Session>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(CacheKeys::session(id)).await.map_err(redis_err)?;
        raw.as_deref().map(decode).transpose()
    }

    async fn get_session_messages(
        &self,
        session_id: &str,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<Message>> {
        self.hydrate_page(
            &CacheKeys::session_messages(session_id),
            CacheKeys::message,
            limit,
            offset,
        )
        .await
    }

    async fn get_sessions(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<Session>> {
        self.hydrate_page(
            &CacheKeys::user_sessions(user_id),
            CacheKeys::session,
            limit,
            offset,
        )
        .await
    }

    async fn delete_message(&self, session_id: &str, message_id: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .del(CacheKeys::message(message_id))
            .ignore()
            .zrem(CacheKeys::session_messages(session_id), message_id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(redis_err)
    }

    async fn delete_session(&self, user_id: &str, session_id: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let index = CacheKeys::session_messages(session_id);
        let message_ids: Vec<String> = conn.zrange(&index, 0, -1).await.map_err(redis_err)?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        for id in &message_ids {
            pipe.del(CacheKeys::message(id)).ignore();
        }
        pipe.del(&index)
            .ignore()
            .del(CacheKeys::session(session_id))
            .ignore()
            .zrem(CacheKeys::user_sessions(user_id), session_id)
            .ignore();

        pipe.query_async::<()>(&mut conn).await.map_err(|e| {
            warn!(session_id, "failed to evict session from cache: {e}");
            redis_err(e)
        })
    }
}
