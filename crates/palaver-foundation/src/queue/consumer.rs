//! 持久化事件处理器
//! Persistence event handler

use async_trait::async_trait;
use palaver_kernel::queue::{ConsumeOutcome, EventHandler, PersistenceEvent};
use palaver_kernel::store::DynConversationStore;
use tracing::{info, warn};

/// 将队列事件写入关系型存储
/// Applies queued events to the relational store
///
/// 写入按 id 幂等，因此重复投递是安全的。写入失败时返回
/// [`ConsumeOutcome::RetryLater`]，事件保留在队列中等待重投。
/// Writes are idempotent by id, so redelivery is harmless. A failed write
/// returns [`ConsumeOutcome::RetryLater`] and the event stays queued.
pub struct PersistenceConsumer {
    store: DynConversationStore,
}

impl PersistenceConsumer {
    pub fn new(store: DynConversationStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventHandler for PersistenceConsumer {
    async fn handle(&self, event: PersistenceEvent) -> ConsumeOutcome {
        let result = match &event {
            PersistenceEvent::SaveMessage(message) => self.store.save_message(message).await,
            PersistenceEvent::SaveSession(session) => self.store.save_session(session).await,
        };

        match result {
            Ok(()) => {
                info!(kind = event.kind(), id = event.entity_id(), "persisted");
                ConsumeOutcome::Success
            }
            Err(e) => {
                warn!(
                    kind = event.kind(),
                    id = event.entity_id(),
                    backend = self.store.backend_name(),
                    "persist failed, will retry: {e}"
                );
                ConsumeOutcome::RetryLater
            }
        }
    }
}
