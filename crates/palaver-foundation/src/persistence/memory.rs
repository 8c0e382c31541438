//! 内存存储后端
//! Memory storage backend
//!
//! 提供基于内存的存储实现，适用于测试和开发环境
//! Provides an in-memory storage implementation, suitable for testing and development environments

use async_trait::async_trait;
use palaver_kernel::conversation::{Message, Session};
use palaver_kernel::store::{ConversationStore, StoreResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// 带插入序号的记录，用于同一时间戳下的稳定排序
/// Record tagged with its insertion sequence, used to break timestamp ties
#[derive(Debug, Clone)]
struct Stored<T> {
    seq: u64,
    value: T,
}

/// 内存存储
/// In-memory storage
///
/// 线程安全的内存存储实现，所有数据存储在内存中。
/// Thread-safe in-memory storage implementation, all data is stored in memory.
/// 适用于：
/// Suitable for:
/// - 单元测试
/// - Unit testing
/// - 开发环境
/// - Development environment
///
/// # 示例
/// # Example
///
/// ```rust,ignore
/// use palaver_foundation::persistence::InMemoryStore;
///
/// let store = InMemoryStore::new();
/// store.save_message(&message).await?;
/// let page = store.get_session_messages(&session_id, 10, 0).await?;
/// ```
pub struct InMemoryStore {
    /// 消息存储
    /// Message storage
    messages: Arc<RwLock<HashMap<String, Stored<Message>>>>,
    /// 会话消息索引 (session_id -> message_ids)
    /// Session message index (session_id -> message_ids)
    session_messages: Arc<RwLock<HashMap<String, Vec<String>>>>,
    /// 会话存储
    /// Session storage
    sessions: Arc<RwLock<HashMap<String, Stored<Session>>>>,
    /// 用户会话索引 (user_id -> session_ids)
    /// User session index (user_id -> session_ids)
    user_sessions: Arc<RwLock<HashMap<String, Vec<String>>>>,
    seq: AtomicU64,
}

impl InMemoryStore {
    /// 创建新的内存存储
    /// Create new in-memory store
    pub fn new() -> Self {
        Self {
            messages: Arc::new(RwLock::new(HashMap::new())),
            session_messages: Arc::new(RwLock::new(HashMap::new())),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            user_sessions: Arc::new(RwLock::new(HashMap::new())),
            seq: AtomicU64::new(0),
        }
    }

    /// 创建共享实例
    /// Create shared instance
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// 获取消息数量
    /// Get message count
    pub async fn message_count(&self) -> usize {
        self.messages.read().await.len()
    }

    /// 获取会话数量
    /// Get session count
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// 索引条目数（会话消息索引 + 用户会话索引）
    /// Index entries held (per-session plus per-user)
    pub async fn index_count(&self) -> usize {
        self.session_messages.read().await.len() + self.user_sessions.read().await.len()
    }

    /// 清空所有数据
    /// Clear all data
    pub async fn clear(&self) {
        self.messages.write().await.clear();
        self.session_messages.write().await.clear();
        self.sessions.write().await.clear();
        self.user_sessions.write().await.clear();
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// 按创建时间倒序分页，时间相同时后插入者在前
/// Newest-first page; later insertions win timestamp ties
fn newest_first_page<T: Clone>(
    mut items: Vec<&Stored<T>>,
    created_at: impl Fn(&T) -> chrono::DateTime<chrono::Utc>,
    limit: usize,
    offset: usize,
) -> Vec<T> {
    items.sort_by(|a, b| {
        created_at(&b.value)
            .cmp(&created_at(&a.value))
            .then(b.seq.cmp(&a.seq))
    });
    items
        .into_iter()
        .skip(offset)
        .take(limit)
        .map(|s| s.value.clone())
        .collect()
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    fn backend_name(&self) -> &str {
        "memory"
    }

    async fn save_message(&self, message: &Message) -> StoreResult<()> {
        let mut messages = self.messages.write().await;
        if messages.contains_key(&message.id) {
            return Ok(());
        }
        messages.insert(
            message.id.clone(),
            Stored {
                seq: self.next_seq(),
                value: message.clone(),
            },
        );
        drop(messages);

        self.session_messages
            .write()
            .await
            .entry(message.session_id.clone())
            .or_default()
            .push(message.id.clone());
        Ok(())
    }

    async fn save_session(&self, session: &Session) -> StoreResult<()> {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get_mut(&session.id) {
            existing.value = session.clone();
            return Ok(());
        }
        sessions.insert(
            session.id.clone(),
            Stored {
                seq: self.next_seq(),
                value: session.clone(),
            },
        );
        drop(sessions);

        self.user_sessions
            .write()
            .await
            .entry(session.user_id.clone())
            .or_default()
            .push(session.id.clone());
        Ok(())
    }

    async fn get_message(&self, id: &str) -> StoreResult<Option<Message>> {
        Ok(self.messages.read().await.get(id).map(|s| s.value.clone()))
    }

    async fn get_session(&self, id: &str) -> StoreResult<Option<Session>> {
        Ok(self.sessions.read().await.get(id).map(|s| s.value.clone()))
    }

    async fn get_session_messages(
        &self,
        session_id: &str,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<Message>> {
        let index = self.session_messages.read().await;
        let messages = self.messages.read().await;
        let items: Vec<&Stored<Message>> = index
            .get(session_id)
            .map(|ids| ids.iter().filter_map(|id| messages.get(id)).collect())
            .unwrap_or_default();
        Ok(newest_first_page(items, |m| m.created_at, limit, offset))
    }

    async fn get_sessions(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<Session>> {
        let index = self.user_sessions.read().await;
        let sessions = self.sessions.read().await;
        let items: Vec<&Stored<Session>> = index
            .get(user_id)
            .map(|ids| ids.iter().filter_map(|id| sessions.get(id)).collect())
            .unwrap_or_default();
        Ok(newest_first_page(items, |s| s.created_at, limit, offset))
    }

    async fn delete_message(&self, _session_id: &str, message_id: &str) -> StoreResult<()> {
        let removed = self.messages.write().await.remove(message_id);
        if let Some(stored) = removed {
            let mut index = self.session_messages.write().await;
            if let Some(ids) = index.get_mut(&stored.value.session_id) {
                ids.retain(|id| id != message_id);
                if ids.is_empty() {
                    index.remove(&stored.value.session_id);
                }
            }
        }
        Ok(())
    }

    async fn delete_session(&self, _user_id: &str, session_id: &str) -> StoreResult<()> {
        let message_ids = self
            .session_messages
            .write()
            .await
            .remove(session_id)
            .unwrap_or_default();
        {
            let mut messages = self.messages.write().await;
            for id in &message_ids {
                messages.remove(id);
            }
        }

        let removed = self.sessions.write().await.remove(session_id);
        if let Some(stored) = removed {
            let mut index = self.user_sessions.write().await;
            if let Some(ids) = index.get_mut(&stored.value.user_id) {
                ids.retain(|id| id != session_id);
                if ids.is_empty() {
                    index.remove(&stored.value.user_id);
                }
            }
        }
        Ok(())
    }
}
