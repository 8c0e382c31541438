//! 进程内队列
//! In-process queue

use async_trait::async_trait;
use palaver_kernel::queue::{
    ConsumeOutcome, EventHandler, EventPublisher, PersistenceEvent, QueueError, QueueResult,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 进程内持久化队列
/// In-process durability queue
///
/// 与 Redis Streams 版本语义相同：至少一次投递，处理失败的事件在
/// `retry_delay` 之后重新入队。进程退出时未处理的事件会丢失。
/// Same contract as the Redis Streams flavour: at-least-once, failed events
/// are re-enqueued after `retry_delay`. Undelivered events are lost when the
/// process exits.
pub struct InMemoryQueue;

impl InMemoryQueue {
    /// 创建一对生产者/消费者
    /// Create a publisher/worker pair
    pub fn channel(retry_delay: Duration) -> (InMemoryPublisher, InMemoryQueueWorker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let publisher = InMemoryPublisher { tx: tx.clone() };
        let worker = InMemoryQueueWorker {
            rx,
            requeue: tx,
            retry_delay,
        };
        (publisher, worker)
    }
}

#[derive(Clone)]
pub struct InMemoryPublisher {
    tx: mpsc::UnboundedSender<PersistenceEvent>,
}

#[async_trait]
impl EventPublisher for InMemoryPublisher {
    async fn publish(&self, event: &PersistenceEvent) -> QueueResult<()> {
        self.tx.send(event.clone()).map_err(|_| QueueError::Closed)
    }
}

pub struct InMemoryQueueWorker {
    rx: mpsc::UnboundedReceiver<PersistenceEvent>,
    requeue: mpsc::UnboundedSender<PersistenceEvent>,
    retry_delay: Duration,
}

impl InMemoryQueueWorker {
    /// 消费事件直到取消，取消时处理已入队的事件
    /// Consume events until cancelled, then apply what is already queued
    pub async fn run(mut self, handler: Arc<dyn EventHandler>, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    self.drain(handler.as_ref()).await;
                    break;
                }
                event = self.rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match handler.handle(event.clone()).await {
                ConsumeOutcome::Success => debug!(id = event.entity_id(), "event acknowledged"),
                ConsumeOutcome::RetryLater => {
                    let requeue = self.requeue.clone();
                    let delay = self.retry_delay;
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        if requeue.send(event).is_err() {
                            warn!("in-memory queue closed, dropping event");
                        }
                    });
                }
            }
        }
        debug!("in-memory queue worker stopped");
    }

    async fn drain(&mut self, handler: &dyn EventHandler) {
        let mut drained = 0usize;
        while let Ok(event) = self.rx.try_recv() {
            if handler.handle(event.clone()).await == ConsumeOutcome::RetryLater {
                warn!(id = event.entity_id(), "dropping event at shutdown");
            }
            drained += 1;
        }
        if drained > 0 {
            debug!(drained, "applied queued events at shutdown");
        }
    }
}
