//! Conversation storage contract
//!
//! Both the cache tier and the relational tier implement
//! [`ConversationStore`]; the repository in `palaver-foundation` composes
//! them. Paged reads are always newest first.

use crate::conversation::{Message, Session};
use async_trait::async_trait;
use std::sync::Arc;

/// Storage error
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),
    /// Query error
    #[error("Query error: {0}")]
    Query(String),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),
    /// Other errors
    #[error("Store error: {0}")]
    Other(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Capability set shared by every conversation storage tier.
///
/// Deletions take the owning key alongside the id (`session_id` for a
/// message, `user_id` for a session) because index-maintaining tiers need
/// it to strip the id from the parent index. Tiers that do not keep such
/// indices ignore it.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Short backend name used in logs.
    fn backend_name(&self) -> &str;

    async fn save_message(&self, message: &Message) -> StoreResult<()>;

    async fn save_session(&self, session: &Session) -> StoreResult<()>;

    async fn get_message(&self, id: &str) -> StoreResult<Option<Message>>;

    async fn get_session(&self, id: &str) -> StoreResult<Option<Session>>;

    /// Page of a session's messages, newest first.
    async fn get_session_messages(
        &self,
        session_id: &str,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<Message>>;

    /// Page of a user's sessions, newest first.
    async fn get_sessions(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<Session>>;

    async fn delete_message(&self, session_id: &str, message_id: &str) -> StoreResult<()>;

    /// Delete a session together with all of its messages.
    async fn delete_session(&self, user_id: &str, session_id: &str) -> StoreResult<()>;
}

pub type DynConversationStore = Arc<dyn ConversationStore>;
