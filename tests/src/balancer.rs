//! Load tracker that remembers every acquire and release

use async_trait::async_trait;
use palaver_kernel::balancer::{BalancerError, BalancerResult, LoadTracker, pick_candidate};
use parking_lot::Mutex;
use std::collections::HashMap;

/// A load change observed by [`RecordingTracker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadEvent {
    Acquired { model: String, address: String },
    Released { model: String, address: String },
}

#[derive(Default)]
pub struct RecordingTracker {
    loads: Mutex<HashMap<(String, String), f64>>,
    history: Mutex<Vec<LoadEvent>>,
}

impl RecordingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_load(&self, model: &str, address: &str, load: f64) {
        self.loads
            .lock()
            .insert((model.to_string(), address.to_string()), load);
    }

    pub fn load(&self, model: &str, address: &str) -> Option<f64> {
        self.loads
            .lock()
            .get(&(model.to_string(), address.to_string()))
            .copied()
    }

    pub fn history(&self) -> Vec<LoadEvent> {
        self.history.lock().clone()
    }

    pub fn acquire_count(&self) -> usize {
        self.count(|e| matches!(e, LoadEvent::Acquired { .. }))
    }

    pub fn release_count(&self) -> usize {
        self.count(|e| matches!(e, LoadEvent::Released { .. }))
    }

    fn count(&self, pred: impl Fn(&LoadEvent) -> bool) -> usize {
        self.history.lock().iter().filter(|e| pred(e)).count()
    }
}

#[async_trait]
impl LoadTracker for RecordingTracker {
    async fn select_and_acquire(&self, model: &str, candidates: &[String]) -> BalancerResult<String> {
        let mut loads = self.loads.lock();
        let idx = pick_candidate(candidates, |c| {
            loads.get(&(model.to_string(), c.to_string())).copied()
        })
        .ok_or_else(|| BalancerError::NoSelection(model.to_string()))?;

        let chosen = candidates[idx].clone();
        *loads
            .entry((model.to_string(), chosen.clone()))
            .or_insert(0.0) += 1.0;
        self.history.lock().push(LoadEvent::Acquired {
            model: model.to_string(),
            address: chosen.clone(),
        });
        Ok(chosen)
    }

    async fn release(&self, model: &str, address: &str) -> BalancerResult<()> {
        *self
            .loads
            .lock()
            .entry((model.to_string(), address.to_string()))
            .or_insert(0.0) -= 1.0;
        self.history.lock().push(LoadEvent::Released {
            model: model.to_string(),
            address: address.to_string(),
        });
        Ok(())
    }

    async fn load_of(&self, model: &str, address: &str) -> BalancerResult<Option<f64>> {
        Ok(self.load(model, address))
    }
}
