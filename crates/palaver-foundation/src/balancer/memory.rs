//! 进程内负载计数
//! In-process load tracker

use async_trait::async_trait;
use palaver_kernel::balancer::{BalancerError, BalancerResult, LoadTracker, pick_candidate};
use parking_lot::Mutex;
use std::collections::HashMap;

/// 单进程部署与测试使用的负载计数器。选择与加一在同一把锁内完成。
/// Load tracker for single-process deployments and tests. Selection and
/// increment happen under one lock.
#[derive(Default)]
pub struct InMemoryLoadTracker {
    loads: Mutex<HashMap<String, HashMap<String, f64>>>,
}

impl InMemoryLoadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 直接设置负载（测试用）
    /// Overwrite a load value
    pub fn set_load(&self, model: &str, address: &str, load: f64) {
        self.loads
            .lock()
            .entry(model.to_string())
            .or_default()
            .insert(address.to_string(), load);
    }
}

#[async_trait]
impl LoadTracker for InMemoryLoadTracker {
    async fn select_and_acquire(&self, model: &str, candidates: &[String]) -> BalancerResult<String> {
        if candidates.is_empty() {
            return Err(BalancerError::NoInstances(model.to_string()));
        }

        let mut loads = self.loads.lock();
        let space = loads.entry(model.to_string()).or_default();
        let idx = pick_candidate(candidates, |c| space.get(c).copied())
            .ok_or_else(|| BalancerError::NoSelection(model.to_string()))?;

        let chosen = candidates[idx].clone();
        *space.entry(chosen.clone()).or_insert(0.0) += 1.0;
        Ok(chosen)
    }

    async fn release(&self, model: &str, address: &str) -> BalancerResult<()> {
        let mut loads = self.loads.lock();
        *loads
            .entry(model.to_string())
            .or_default()
            .entry(address.to_string())
            .or_insert(0.0) -= 1.0;
        Ok(())
    }

    async fn load_of(&self, model: &str, address: &str) -> BalancerResult<Option<f64>> {
        Ok(self
            .loads
            .lock()
            .get(model)
            .and_then(|space| space.get(address))
            .copied())
    }
}
