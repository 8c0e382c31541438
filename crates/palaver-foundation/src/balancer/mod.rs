//! 模型负载均衡
//! Model load balancing
//!
//! 每次选择都先做服务发现，再由 [`LoadTracker`] 在一次原子操作中完成
//! “选择 + 计数加一”。
//! Every selection discovers healthy instances first, then asks the
//! [`LoadTracker`] to pick and increment in one atomic step.

mod memory;
mod redis_tracker;

pub use memory::InMemoryLoadTracker;
pub use redis_tracker::RedisLoadTracker;

use palaver_kernel::balancer::{
    BalancerError, BalancerResult, DynLoadTracker, DynServiceDiscovery,
};
use tracing::{debug, instrument, warn};

/// Redis 中模型负载索引的键
/// Key of the per-model load index
pub fn model_key(model: &str) -> String {
    format!("llm_models:{model}")
}

/// 模型负载均衡器
/// Model load balancer
#[derive(Clone)]
pub struct ModelLoadBalancer {
    discovery: DynServiceDiscovery,
    tracker: DynLoadTracker,
}

impl ModelLoadBalancer {
    pub fn new(discovery: DynServiceDiscovery, tracker: DynLoadTracker) -> Self {
        Self { discovery, tracker }
    }

    /// 选择一个后端实例并占用一个负载计数
    /// Select a backend for `model` and take one unit of its load
    #[instrument(skip(self), fields(model = %model))]
    pub async fn select(&self, model: &str) -> BalancerResult<String> {
        let instances = self.discovery.discover(model).await?;
        if instances.is_empty() {
            return Err(BalancerError::NoInstances(model.to_string()));
        }

        let candidates: Vec<String> = instances.iter().map(|i| i.endpoint()).collect();
        let chosen = self.tracker.select_and_acquire(model, &candidates).await?;
        debug!(backend = %chosen, candidates = candidates.len(), "backend selected");
        Ok(chosen)
    }

    /// 释放一个负载计数
    /// Give back one unit of load
    pub async fn release(&self, model: &str, address: &str) -> BalancerResult<()> {
        self.tracker.release(model, address).await.inspect_err(|e| {
            warn!(model, backend = address, "failed to release backend load: {e}");
        })
    }

    /// 当前记录的负载（未记录时为 `None`）
    /// Recorded load, `None` if unrecorded
    pub async fn load_of(&self, model: &str, address: &str) -> BalancerResult<Option<f64>> {
        self.tracker.load_of(model, address).await
    }
}
