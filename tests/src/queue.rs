//! Durability queue doubles

use async_trait::async_trait;
use palaver_kernel::queue::{EventPublisher, PersistenceEvent, QueueError, QueueResult};
use parking_lot::Mutex;

/// A publisher whose broker is always down.
#[derive(Debug, Default)]
pub struct FailingPublisher;

#[async_trait]
impl EventPublisher for FailingPublisher {
    async fn publish(&self, event: &PersistenceEvent) -> QueueResult<()> {
        Err(QueueError::Publish(format!(
            "broker unreachable, dropped {}",
            event.kind()
        )))
    }
}

/// Accepts and keeps every event without applying it.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<PersistenceEvent>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PersistenceEvent> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|e| e.kind()).collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: &PersistenceEvent) -> QueueResult<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}
