//! 进程内缓存
//! In-process cache tier
//!
//! 未配置 Redis 时使用。条目与 Redis 一样带 TTL，过期后在下一次访问时淘汰。
//! Used when no Redis is configured. Entries carry the same TTLs as in
//! Redis and are evicted on the next cache access after they expire.
//! Index entries live exactly as long as the entries they point at, and
//! evicting a session drops its cached messages with it.

use super::CacheTtl;
use crate::persistence::InMemoryStore;
use async_trait::async_trait;
use palaver_kernel::conversation::{Message, Session};
use palaver_kernel::store::{ConversationStore, StoreResult};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Entry {
    Message { id: String, session_id: String },
    Session { id: String, user_id: String },
}

/// 过期队列：按截止时间排序，`deadlines` 保存每个条目的当前截止时间。
/// Expiry queue ordered by deadline. `deadlines` holds each entry's current
/// deadline; queue items that no longer match it are stale and skipped.
#[derive(Default)]
struct Expiries {
    queue: BTreeMap<(Instant, u64), Entry>,
    deadlines: HashMap<Entry, Instant>,
    seq: u64,
}

impl Expiries {
    fn touch(&mut self, entry: Entry, ttl: Duration) {
        let deadline = Instant::now() + ttl;
        self.seq += 1;
        self.queue.insert((deadline, self.seq), entry.clone());
        self.deadlines.insert(entry, deadline);
    }

    fn forget(&mut self, entry: &Entry) {
        self.deadlines.remove(entry);
    }

    fn take_due(&mut self, now: Instant) -> Vec<Entry> {
        let mut due = Vec::new();
        while let Some(item) = self.queue.first_entry() {
            if item.key().0 > now {
                break;
            }
            let ((deadline, _), entry) = item.remove_entry();
            if self.deadlines.get(&entry) == Some(&deadline) {
                self.deadlines.remove(&entry);
                due.push(entry);
            }
        }
        if self.deadlines.is_empty() {
            self.queue.clear();
        }
        due
    }

    fn tracked(&self) -> usize {
        self.deadlines.len()
    }
}

/// 带 TTL 的进程内缓存
/// TTL-bounded in-process cache
pub struct InProcessCache {
    data: InMemoryStore,
    ttl: CacheTtl,
    expiries: Mutex<Expiries>,
}

impl InProcessCache {
    pub fn new(ttl: CacheTtl) -> Self {
        Self {
            data: InMemoryStore::new(),
            ttl,
            expiries: Mutex::new(Expiries::default()),
        }
    }

    /// Entries currently held, expired or not.
    pub fn tracked(&self) -> usize {
        self.expiries.lock().tracked()
    }

    /// Drop everything whose TTL has run out.
    pub async fn evict_expired(&self) {
        let due = self.expiries.lock().take_due(Instant::now());
        for entry in due {
            let evicted = match &entry {
                Entry::Message { id, session_id } => self.data.delete_message(session_id, id).await,
                Entry::Session { id, user_id } => self.data.delete_session(user_id, id).await,
            };
            if let Err(e) = evicted {
                tracing::debug!(?entry, "cache eviction failed: {e}");
            }
        }
    }

    pub fn store(&self) -> &InMemoryStore {
        &self.data
    }
}

#[async_trait]
impl ConversationStore for InProcessCache {
    fn backend_name(&self) -> &str {
        "in-process cache"
    }

    async fn save_message(&self, message: &Message) -> StoreResult<()> {
        self.evict_expired().await;
        self.data.save_message(message).await?;
        let entry = Entry::Message {
            id: message.id.clone(),
            session_id: message.session_id.clone(),
        };
        self.expiries.lock().touch(entry, self.ttl.message);
        Ok(())
    }

    async fn save_session(&self, session: &Session) -> StoreResult<()> {
        self.evict_expired().await;
        self.data.save_session(session).await?;
        let entry = Entry::Session {
            id: session.id.clone(),
            user_id: session.user_id.clone(),
        };
        self.expiries.lock().touch(entry, self.ttl.session);
        Ok(())
    }

    async fn get_message(&self, id: &str) -> StoreResult<Option<Message>> {
        self.evict_expired().await;
        self.data.get_message(id).await
    }

    async fn get_session(&self, id: &str) -> StoreResult<Option<Session>> {
        self.evict_expired().await;
        self.data.get_session(id).await
    }

    async fn get_session_messages(
        &self,
        session_id: &str,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<Message>> {
        self.evict_expired().await;
        self.data.get_session_messages(session_id, limit, offset).await
    }

    async fn get_sessions(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<Session>> {
        self.evict_expired().await;
        self.data.get_sessions(user_id, limit, offset).await
    }

    async fn delete_message(&self, session_id: &str, message_id: &str) -> StoreResult<()> {
        self.expiries.lock().forget(&Entry::Message {
            id: message_id.to_string(),
            session_id: session_id.to_string(),
        });
        self.data.delete_message(session_id, message_id).await
    }

    async fn delete_session(&self, user_id: &str, session_id: &str) -> StoreResult<()> {
        let message_ids: Vec<String> = self
            .data
            .get_session_messages(session_id, usize::MAX, 0)
            .await?
            .into_iter()
            .map(|m| m.id)
            .collect();
        {
            let mut expiries = self.expiries.lock();
            expiries.forget(&Entry::Session {
                id: session_id.to_string(),
                user_id: user_id.to_string(),
            });
            for id in message_ids {
                expiries.forget(&Entry::Message {
                    id,
                    session_id: session_id.to_string(),
                });
            }
        }
        self.data.delete_session(user_id, session_id).await
    }
}
