//! Redis Streams 传输
//! Redis Streams transport
//!
//! 每条流记录包含两个字段：`kind`（事件类型）与 `payload`（实体 JSON）。
//! Each stream entry carries two fields: `kind` (event type) and `payload`
//! (entity JSON).

use super::QueueSettings;
use async_trait::async_trait;
use palaver_kernel::queue::{
    ConsumeOutcome, EventHandler, EventPublisher, PersistenceEvent, QueueError, QueueResult,
};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamMaxlen, StreamReadOptions, StreamReadReply};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const FIELD_KIND: &str = "kind";
const FIELD_PAYLOAD: &str = "payload";

/// 流生产者
/// Stream producer
#[derive(Clone)]
pub struct RedisStreamPublisher {
    conn: ConnectionManager,
    stream_key: String,
    max_len: usize,
}

impl RedisStreamPublisher {
    pub fn new(conn: ConnectionManager, settings: &QueueSettings) -> Self {
        Self {
            conn,
            stream_key: settings.stream_key.clone(),
            max_len: settings.max_len,
        }
    }
}

#[async_trait]
impl EventPublisher for RedisStreamPublisher {
    async fn publish(&self, event: &PersistenceEvent) -> QueueResult<()> {
        let payload = event.encode_payload()?;
        let fields = [(FIELD_KIND, event.kind()), (FIELD_PAYLOAD, payload.as_str())];
        let mut conn = self.conn.clone();

        let added: redis::RedisResult<String> = if self.max_len > 0 {
            conn.xadd_maxlen(
                &self.stream_key,
                StreamMaxlen::Approx(self.max_len),
                "*",
                &fields,
            )
            .await
        } else {
            conn.xadd(&self.stream_key, "*", &fields).await
        };
        let id = added.map_err(|e| QueueError::Publish(e.to_string()))?;

        debug!(stream = %self.stream_key, entry = %id, kind = event.kind(), "event published");
        Ok(())
    }
}

/// 流消费者（消费者组）
/// Stream consumer (consumer group member)
///
/// 阻塞读取会占用连接，因此消费者必须使用独立连接。
/// Blocking reads hold the connection; the consumer must own a dedicated one.
pub struct RedisStreamConsumer {
    conn: ConnectionManager,
    settings: QueueSettings,
}

/// 单次读取的结果
/// Result of one read/apply pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollStats {
    pub read: usize,
    pub acked: usize,
    pub retry: bool,
}

impl RedisStreamConsumer {
    pub fn new(conn: ConnectionManager, settings: QueueSettings) -> Self {
        Self { conn, settings }
    }

    /// 创建消费者组（已存在时忽略）
    /// Create the consumer group, tolerating an existing one
    pub async fn ensure_group(&self) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> = conn
            .xgroup_create_mkstream(&self.settings.stream_key, &self.settings.group, "0")
            .await;
        match created {
            Ok(()) => {
                info!(stream = %self.settings.stream_key, group = %self.settings.group, "consumer group created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(QueueError::Consume(e.to_string())),
        }
    }

    /// 读取一批记录并交给处理器
    /// Read one batch and hand it to `handler`
    ///
    /// `pending` 为真时重读本消费者已领取但未确认的记录（id `0`），
    /// 否则阻塞等待新记录（id `>`）。遇到第一条 `RetryLater` 即停止本批。
    /// With `pending` set, re-reads entries this consumer already claimed but
    /// never acknowledged (id `0`); otherwise blocks for new entries (id `>`).
    /// Stops the batch at the first `RetryLater`.
    pub async fn poll_once(
        &self,
        handler: &dyn EventHandler,
        pending: bool,
    ) -> QueueResult<PollStats> {
        let mut conn = self.conn.clone();
        let mut options = StreamReadOptions::default()
            .group(&self.settings.group, &self.settings.consumer)
            .count(self.settings.batch_size);
        let start_id = if pending {
            "0"
        } else {
            options = options.block(self.settings.block.as_millis() as usize);
            ">"
        };

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.settings.stream_key], &[start_id], &options)
            .await
            .map_err(|e| QueueError::Consume(e.to_string()))?;

        let entries: Vec<StreamId> = reply
            .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect())
            .unwrap_or_default();
        let read = entries.len();
        let settled = settle_batch(handler, entries).await;

        if !settled.ack.is_empty() {
            let _: i64 = conn
                .xack(&self.settings.stream_key, &self.settings.group, &settled.ack)
                .await
                .map_err(|e| QueueError::Consume(e.to_string()))?;
        }
        Ok(PollStats {
            read,
            acked: settled.ack.len(),
            retry: settled.retry,
        })
    }

    /// 消费循环，直到取消
    /// Consume until cancelled
    pub async fn run(self, handler: Arc<dyn EventHandler>, cancel: CancellationToken) {
        if let Err(e) = self.ensure_group().await {
            error!("failed to create consumer group: {e}");
        }

        let mut pending = true;
        info!(
            stream = %self.settings.stream_key,
            group = %self.settings.group,
            consumer = %self.settings.consumer,
            "persistence consumer started"
        );

        loop {
            let polled = tokio::select! {
                _ = cancel.cancelled() => break,
                polled = self.poll_once(handler.as_ref(), pending) => polled,
            };

            match polled {
                Ok(stats) => {
                    pending = next_pending(pending, stats);
                    if stats.retry {
                        self.backoff(&cancel).await;
                    }
                }
                Err(e) => {
                    warn!("stream read failed: {e}");
                    if e.to_string().contains("NOGROUP") {
                        let _ = self.ensure_group().await;
                    }
                    self.backoff(&cancel).await;
                }
            }
        }
        info!("persistence consumer stopped");
    }

    async fn backoff(&self, cancel: &CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(self.settings.retry_delay) => {}
        }
    }
}

/// 一批记录的处理结果
/// Outcome of applying one batch
#[derive(Debug, Default, PartialEq, Eq)]
struct Settled {
    /// Entry ids to acknowledge.
    ack: Vec<String>,
    /// A handler asked for redelivery; later entries were not attempted.
    retry: bool,
}

/// Apply entries in order, stopping at the first `RetryLater`.
/// Undecodable entries can never succeed and are acknowledged.
async fn settle_batch(handler: &dyn EventHandler, entries: Vec<StreamId>) -> Settled {
    let mut settled = Settled::default();
    for entry in entries {
        let outcome = match decode_entry(&entry) {
            Ok(event) => handler.handle(event).await,
            Err(e) => {
                warn!(entry = %entry.id, "dropping stream entry: {e}");
                ConsumeOutcome::Success
            }
        };
        match outcome {
            ConsumeOutcome::Success => settled.ack.push(entry.id),
            ConsumeOutcome::RetryLater => {
                settled.retry = true;
                break;
            }
        }
    }
    settled
}

/// 下一次读取是否重读待确认记录
/// Whether the next read re-reads this consumer's unacknowledged entries
///
/// A retry sends the consumer back to its pending entries; an empty pending
/// read means they are all settled and new entries (`>`) come next.
fn next_pending(pending: bool, stats: PollStats) -> bool {
    if stats.retry {
        true
    } else if pending && stats.read == 0 {
        false
    } else {
        pending
    }
}

fn decode_entry(entry: &StreamId) -> QueueResult<PersistenceEvent> {
    let kind: String = entry
        .get(FIELD_KIND)
        .ok_or_else(|| QueueError::Codec(format!("entry {} has no kind", entry.id)))?;
    let payload: String = entry
        .get(FIELD_PAYLOAD)
        .ok_or_else(|| QueueError::Codec(format!("entry {} has no payload", entry.id)))?;
    PersistenceEvent::decode(&kind, &payload)
}
