//! 会话仓库
//! Conversation repository
//!
//! 组合缓存层与关系存储：写入先落缓存（尽力而为），再投递持久化事件，
//! 投递失败则同步写库；读取先查缓存，未命中再查库并异步回填缓存。
//! Composes the cache tier and the relational tier. Writes go to the cache
//! best-effort, then onto the durability queue, falling back to a
//! synchronous store write when publishing fails. Reads try the cache
//! first; on a miss the store answers and the cache is refilled in the
//! background. A page is always served by exactly one tier.

use crate::background::BackgroundTasks;
use crate::metrics::ChatMetrics;
use palaver_kernel::conversation::{Message, Role, Session};
use palaver_kernel::error::{ChatError, ChatResult};
use palaver_kernel::queue::{DynEventPublisher, PersistenceEvent};
use palaver_kernel::store::{DynConversationStore, StoreError};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Default bound for titles derived from a first message.
pub const DEFAULT_TITLE_CHARS: usize = 20;

pub struct ConversationRepository {
    cache: DynConversationStore,
    store: DynConversationStore,
    publisher: Option<DynEventPublisher>,
    tasks: BackgroundTasks,
    metrics: Option<Arc<ChatMetrics>>,
    title_chars: usize,
}

impl ConversationRepository {
    /// Without a publisher every write goes to `store` synchronously.
    pub fn new(cache: DynConversationStore, store: DynConversationStore, tasks: BackgroundTasks) -> Self {
        Self {
            cache,
            store,
            publisher: None,
            tasks,
            metrics: None,
            title_chars: DEFAULT_TITLE_CHARS,
        }
    }

    pub fn with_publisher(mut self, publisher: DynEventPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<ChatMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_title_chars(mut self, title_chars: usize) -> Self {
        self.title_chars = title_chars;
        self
    }

    fn cache_failed(&self, op: &'static str, err: &StoreError) {
        warn!(op, backend = self.cache.backend_name(), "cache operation failed: {err}");
        if let Some(metrics) = &self.metrics {
            metrics.cache_errors.with_label_values(&[op]).inc();
        }
    }

    // ========================================================================
    // 写路径
    // Write path
    // ========================================================================

    /// 确保会话存在
    /// Return `existing` unchanged, or create a session titled from `first_message`
    pub async fn ensure_session(
        &self,
        user_id: &str,
        existing: Option<&str>,
        first_message: &str,
    ) -> ChatResult<String> {
        if let Some(id) = existing.filter(|id| !id.is_empty()) {
            return Ok(id.to_string());
        }
        let session = Session::new(user_id, first_message, self.title_chars);
        self.save_session(&session).await?;
        Ok(session.id)
    }

    /// Build and persist a new turn.
    pub async fn save_message(
        &self,
        session_id: &str,
        user_id: &str,
        role: Role,
        content: &str,
    ) -> ChatResult<Message> {
        let message = Message::new(session_id, user_id, role, content);
        if let Err(e) = self.cache.save_message(&message).await {
            self.cache_failed("save_message", &e);
        }
        self.persist(PersistenceEvent::SaveMessage(message.clone())).await?;
        Ok(message)
    }

    pub async fn save_session(&self, session: &Session) -> ChatResult<()> {
        if let Err(e) = self.cache.save_session(session).await {
            self.cache_failed("save_session", &e);
        }
        self.persist(PersistenceEvent::SaveSession(session.clone())).await
    }

    /// Enqueue, or write through when there is no queue or publishing fails.
    async fn persist(&self, event: PersistenceEvent) -> ChatResult<()> {
        if let Some(publisher) = &self.publisher {
            match publisher.publish(&event).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        kind = event.kind(),
                        id = event.entity_id(),
                        "publish failed, writing synchronously: {e}"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.queue_fallback_writes.inc();
                    }
                }
            }
        }

        let written = match &event {
            PersistenceEvent::SaveMessage(message) => self.store.save_message(message).await,
            PersistenceEvent::SaveSession(session) => self.store.save_session(session).await,
        };
        written.map_err(|e| {
            error!(kind = event.kind(), id = event.entity_id(), "synchronous write failed: {e}");
            ChatError::Internal(format!("{} {}: {e}", event.kind(), event.entity_id()))
        })
    }

    // ========================================================================
    // 读路径
    // Read path
    // ========================================================================

    /// 查找会话（缓存 → 数据库）
    /// Look a session up, cache first
    pub async fn find_session(&self, id: &str) -> ChatResult<Option<Session>> {
        match self.cache.get_session(id).await {
            Ok(Some(session)) => return Ok(Some(session)),
            Ok(None) => {}
            Err(e) => self.cache_failed("get_session", &e),
        }

        let Some(session) = self.store.get_session(id).await? else {
            return Ok(None);
        };

        let cache = self.cache.clone();
        let refill = session.clone();
        self.tasks.spawn("refill_session", async move {
            if let Err(e) = cache.save_session(&refill).await {
                debug!(session_id = %refill.id, "cache refill failed: {e}");
            }
        });
        Ok(Some(session))
    }

    pub async fn get_session(&self, id: &str) -> ChatResult<Session> {
        self.find_session(id)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("session {id}")))
    }

    /// Page of a session's messages, newest first.
    pub async fn get_session_messages(
        &self,
        session_id: &str,
        limit: usize,
        offset: usize,
    ) -> ChatResult<Vec<Message>> {
        match self.cache.get_session_messages(session_id, limit, offset).await {
            Ok(page) if !page.is_empty() => return Ok(page),
            Ok(_) => {}
            Err(e) => self.cache_failed("get_session_messages", &e),
        }

        let page = self.store.get_session_messages(session_id, limit, offset).await?;
        if !page.is_empty() {
            let cache = self.cache.clone();
            let refill = page.clone();
            self.tasks.spawn("refill_messages", async move {
                for message in &refill {
                    if let Err(e) = cache.save_message(message).await {
                        debug!(message_id = %message.id, "cache refill failed: {e}");
                        break;
                    }
                }
            });
        }
        Ok(page)
    }

    /// Page of a user's sessions, newest first.
    pub async fn get_user_sessions(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> ChatResult<Vec<Session>> {
        match self.cache.get_sessions(user_id, limit, offset).await {
            Ok(page) if !page.is_empty() => return Ok(page),
            Ok(_) => {}
            Err(e) => self.cache_failed("get_sessions", &e),
        }

        let page = self.store.get_sessions(user_id, limit, offset).await?;
        if !page.is_empty() {
            let cache = self.cache.clone();
            let refill = page.clone();
            self.tasks.spawn("refill_sessions", async move {
                for session in &refill {
                    if let Err(e) = cache.save_session(session).await {
                        debug!(session_id = %session.id, "cache refill failed: {e}");
                        break;
                    }
                }
            });
        }
        Ok(page)
    }

    async fn find_message(&self, id: &str) -> ChatResult<Option<Message>> {
        match self.cache.get_message(id).await {
            Ok(Some(message)) => return Ok(Some(message)),
            Ok(None) => {}
            Err(e) => self.cache_failed("get_message", &e),
        }
        Ok(self.store.get_message(id).await?)
    }

    // ========================================================================
    // 删除
    // Deletion
    // ========================================================================

    /// 删除会话及其全部消息
    /// Delete a session and all of its messages
    ///
    /// A session absent from both tiers counts as already deleted.
    pub async fn delete_session(&self, session_id: &str, requesting_user: &str) -> ChatResult<()> {
        let Some(session) = self.find_session(session_id).await? else {
            debug!(session_id, "session already gone");
            return Ok(());
        };
        if !session.is_owned_by(requesting_user) {
            return Err(ChatError::PermissionDenied(format!(
                "session {session_id} is not owned by {requesting_user}"
            )));
        }

        if let Err(e) = self.cache.delete_session(&session.user_id, session_id).await {
            self.cache_failed("delete_session", &e);
        }
        self.store.delete_session(&session.user_id, session_id).await?;
        Ok(())
    }

    /// 删除单条消息
    /// Delete one message. Unknown ids are a no-op.
    pub async fn delete_message(&self, message_id: &str) -> ChatResult<()> {
        let Some(message) = self.find_message(message_id).await? else {
            debug!(message_id, "message already gone");
            return Ok(());
        };

        if let Err(e) = self.cache.delete_message(&message.session_id, message_id).await {
            self.cache_failed("delete_message", &e);
        }
        self.store.delete_message(&message.session_id, message_id).await?;
        Ok(())
    }
}
