//! Fault-injecting storage tier

use async_trait::async_trait;
use palaver_kernel::conversation::{Message, Session};
use palaver_kernel::store::{ConversationStore, DynConversationStore, StoreError, StoreResult};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Wraps a store and fails reads or writes on demand.
///
/// Every call is counted, failed or not, so tests can tell whether a tier
/// was consulted at all.
pub struct FlakyStore {
    inner: DynConversationStore,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: DynConversationStore) -> Self {
        Self {
            inner,
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_all(&self, fail: bool) {
        self.fail_reads(fail);
        self.fail_writes(fail);
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn read(&self) -> StoreResult<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("injected read failure".to_string()));
        }
        Ok(())
    }

    fn write(&self) -> StoreResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("injected write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for FlakyStore {
    fn backend_name(&self) -> &str {
        "flaky"
    }

    async fn save_message(&self, message: &Message) -> StoreResult<()> {
        self.write()?;
        self.inner.save_message(message).await
    }

    async fn save_session(&self, session: &Session) -> StoreResult<()> {
        self.write()?;
        self.inner.save_session(session).await
    }

    async fn get_message(&self, id: &str) -> StoreResult<Option<Message>> {
        self.read()?;
        self.inner.get_message(id).await
    }

    async fn get_session(&self, id: &str) -> StoreResult<Option<Session>> {
        self.read()?;
        self.inner.get_session(id).await
    }

    async fn get_session_messages(
        &self,
        session_id: &str,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<Message>> {
        self.read()?;
        self.inner
            .get_session_messages(session_id, limit, offset)
            .await
    }

    async fn get_sessions(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<Session>> {
        self.read()?;
        self.inner.get_sessions(user_id, limit, offset).await
    }

    async fn delete_message(&self, session_id: &str, message_id: &str) -> StoreResult<()> {
        self.write()?;
        self.inner.delete_message(session_id, message_id).await
    }

    async fn delete_session(&self, user_id: &str, session_id: &str) -> StoreResult<()> {
        self.write()?;
        self.inner.delete_session(user_id, session_id).await
    }
}
