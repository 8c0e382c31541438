//! Durability queue contract
//!
//! Writes accepted on the hot path are committed to the relational store
//! through a message bus. Each entry on the bus is a [`PersistenceEvent`]
//! encoded as a `kind` tag plus a JSON `payload`. Delivery is at least once.

use crate::conversation::{Message, Session};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Default stream/topic carrying persistence events.
pub const TOPIC_PERSISTENCE: &str = "persist_topic";

pub const KIND_SAVE_MESSAGE: &str = "save_message";
pub const KIND_SAVE_SESSION: &str = "save_session";

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("publish failed: {0}")]
    Publish(String),

    #[error("consume failed: {0}")]
    Consume(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("unknown event kind: {0}")]
    UnknownKind(String),

    #[error("queue closed")]
    Closed,
}

pub type QueueResult<T> = Result<T, QueueError>;

/// A persistence request placed on the durability queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum PersistenceEvent {
    SaveMessage(Message),
    SaveSession(Session),
}

impl PersistenceEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            PersistenceEvent::SaveMessage(_) => KIND_SAVE_MESSAGE,
            PersistenceEvent::SaveSession(_) => KIND_SAVE_SESSION,
        }
    }

    /// Id of the entity carried by the event.
    pub fn entity_id(&self) -> &str {
        match self {
            PersistenceEvent::SaveMessage(m) => &m.id,
            PersistenceEvent::SaveSession(s) => &s.id,
        }
    }

    /// Encode only the entity, for transports that carry `kind` separately.
    pub fn encode_payload(&self) -> QueueResult<String> {
        let encoded = match self {
            PersistenceEvent::SaveMessage(m) => serde_json::to_string(m),
            PersistenceEvent::SaveSession(s) => serde_json::to_string(s),
        };
        encoded.map_err(|e| QueueError::Codec(e.to_string()))
    }

    /// Rebuild an event from a `kind` tag and its JSON payload.
    pub fn decode(kind: &str, payload: &str) -> QueueResult<Self> {
        match kind {
            KIND_SAVE_MESSAGE => serde_json::from_str(payload)
                .map(PersistenceEvent::SaveMessage)
                .map_err(|e| QueueError::Codec(e.to_string())),
            KIND_SAVE_SESSION => serde_json::from_str(payload)
                .map(PersistenceEvent::SaveSession)
                .map_err(|e| QueueError::Codec(e.to_string())),
            other => Err(QueueError::UnknownKind(other.to_string())),
        }
    }
}

/// Producer side of the durability queue.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &PersistenceEvent) -> QueueResult<()>;
}

pub type DynEventPublisher = Arc<dyn EventPublisher>;

/// Result of applying one event on the consumer side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Applied (or deliberately dropped); acknowledge it.
    Success,
    /// Transient failure; leave it for redelivery.
    RetryLater,
}

/// Consumer side of the durability queue.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: PersistenceEvent) -> ConsumeOutcome;
}
