//! Redis 负载计数
//! Redis load tracker
//!
//! 负载保存在有序集合 `llm_models:<model>` 中，成员为 `host:port`，分数为
//! 正在处理的请求数。选择在服务端 Lua 脚本中原子完成。
//! Load lives in the sorted set `llm_models:<model>`: members are
//! `host:port`, scores are in-flight request counts. Selection runs
//! atomically inside a server-side Lua script.

use super::model_key;
use async_trait::async_trait;
use palaver_kernel::balancer::{BalancerError, BalancerResult, LoadTracker};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::sync::LazyLock;

/// 扫描候选：首个空闲（分数缺失或为 0）者立即胜出，否则取最小分数、
/// 平局取先出现者；胜者分数加一。
/// Scan candidates: the first idle one (missing or zero score) wins at
/// once, otherwise the minimum score wins with first occurrence breaking
/// ties; the winner's score is incremented.
const SELECT_AND_ACQUIRE: &str = r#"
local key = KEYS[1]
local best_member = nil
local min_score = nil

for _, member in ipairs(ARGV) do
    local score = redis.call("ZSCORE", key, member)
    if not score then
        redis.call("ZADD", key, 1, member)
        return member
    end
    score = tonumber(score)
    if score == 0 then
        redis.call("ZINCRBY", key, 1, member)
        return member
    end
    if min_score == nil or score < min_score then
        min_score = score
        best_member = member
    end
end

if best_member then
    redis.call("ZINCRBY", key, 1, best_member)
    return best_member
end
return nil
"#;

static SELECT_SCRIPT: LazyLock<redis::Script> =
    LazyLock::new(|| redis::Script::new(SELECT_AND_ACQUIRE));

/// 基于 Redis 的负载计数器，可在多个服务实例间共享
/// Redis-backed tracker, shared across service replicas
#[derive(Clone)]
pub struct RedisLoadTracker {
    conn: ConnectionManager,
}

impl RedisLoadTracker {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

fn tracker_err(err: redis::RedisError) -> BalancerError {
    BalancerError::Tracker(err.to_string())
}

#[async_trait]
impl LoadTracker for RedisLoadTracker {
    async fn select_and_acquire(&self, model: &str, candidates: &[String]) -> BalancerResult<String> {
        if candidates.is_empty() {
            return Err(BalancerError::NoInstances(model.to_string()));
        }

        let mut conn = self.conn.clone();
        let mut invocation = SELECT_SCRIPT.key(model_key(model));
        for candidate in candidates {
            invocation.arg(candidate);
        }
        let chosen: Option<String> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(tracker_err)?;

        chosen.ok_or_else(|| BalancerError::NoSelection(model.to_string()))
    }

    async fn release(&self, model: &str, address: &str) -> BalancerResult<()> {
        let mut conn = self.conn.clone();
        let _: f64 = conn
            .zincr(model_key(model), address, -1)
            .await
            .map_err(tracker_err)?;
        Ok(())
    }

    async fn load_of(&self, model: &str, address: &str) -> BalancerResult<Option<f64>> {
        let mut conn = self.conn.clone();
        conn.zscore(model_key(model), address)
            .await
            .map_err(tracker_err)
    }
}
