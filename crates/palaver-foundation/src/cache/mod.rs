//! 缓存层
//! Cache tier
//!
//! Redis 中的会话与消息副本，带 TTL，从不作为唯一数据来源。
//! Redis copies of sessions and messages, always with a TTL, never the only
//! copy of anything that must survive a restart.
//!
//! ```text
//!   message:<id>                 JSON message          (message TTL)
//!   session:<id>                 JSON session          (session TTL)
//!   session_messages:<sid>       ZSET id -> µs time    (index TTL)
//!   user_sessions:<uid>          ZSET id -> µs time    (session TTL)
//! ```

mod memory;
mod redis_cache;

pub use memory::InProcessCache;
pub use redis_cache::RedisCache;

use crate::duration_serde::secs;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 缓存键
/// Cache key layout
pub struct CacheKeys;

impl CacheKeys {
    pub fn message(id: &str) -> String {
        format!("message:{id}")
    }

    pub fn session(id: &str) -> String {
        format!("session:{id}")
    }

    pub fn session_messages(session_id: &str) -> String {
        format!("session_messages:{session_id}")
    }

    pub fn user_sessions(user_id: &str) -> String {
        format!("user_sessions:{user_id}")
    }
}

/// 缓存过期时间
/// Cache TTLs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheTtl {
    #[serde(with = "secs")]
    pub message: Duration,
    #[serde(with = "secs")]
    pub session: Duration,
    #[serde(with = "secs")]
    pub session_index: Duration,
    #[serde(with = "secs")]
    pub user_index: Duration,
}

impl Default for CacheTtl {
    fn default() -> Self {
        const HOUR: u64 = 60 * 60;
        Self {
            message: Duration::from_secs(24 * HOUR),
            session: Duration::from_secs(48 * HOUR),
            session_index: Duration::from_secs(24 * HOUR),
            user_index: Duration::from_secs(48 * HOUR),
        }
    }
}
