//! 持久化队列
//! Durability queue
//!
//! 热路径上接受的写入通过队列异步提交到关系型存储。
//! Writes accepted on the hot path are committed to the relational store
//! asynchronously through this queue.
//!
//! ```text
//!  ConversationRepository ──publish──▶ stream ──read──▶ consumer loop
//!                                                       │
//!                                                       ▼
//!                                               PersistenceConsumer
//!                                                       │
//!                                                       ▼
//!                                                 relational store
//! ```
//!
//! - [`RedisStreamPublisher`] / [`RedisStreamConsumer`]: Redis Streams with a
//!   consumer group, at-least-once delivery
//! - [`InMemoryQueue`]: in-process channel, for tests and single-node runs

mod consumer;
mod memory;
mod redis_stream;

pub use consumer::PersistenceConsumer;
pub use memory::{InMemoryPublisher, InMemoryQueue, InMemoryQueueWorker};
pub use redis_stream::{PollStats, RedisStreamConsumer, RedisStreamPublisher};

use crate::duration_serde::millis;
use palaver_kernel::queue::TOPIC_PERSISTENCE;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 队列后端
/// Queue backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    #[default]
    Redis,
    Memory,
    /// 不使用队列，写入同步落库
    /// No queue; writes go to the database synchronously
    None,
}

/// 队列配置
/// Queue settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub backend: QueueBackend,
    pub stream_key: String,
    pub group: String,
    pub consumer: String,
    pub batch_size: usize,
    #[serde(with = "millis")]
    pub block: Duration,
    #[serde(with = "millis")]
    pub retry_delay: Duration,
    /// Approximate stream length cap; 0 disables trimming.
    pub max_len: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            backend: QueueBackend::default(),
            stream_key: TOPIC_PERSISTENCE.to_string(),
            group: "persistence_group".to_string(),
            consumer: "persistence-1".to_string(),
            batch_size: 32,
            block: Duration::from_millis(2_000),
            retry_delay: Duration::from_millis(1_000),
            max_len: 100_000,
        }
    }
}
