//! Backend selection contracts
//!
//! Load is tracked per `(model name, backend address)`. A tracker must
//! select and increment in one atomic step; callers never read-modify-write
//! a counter themselves.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum BalancerError {
    #[error("no healthy instances found for service {0}")]
    NoInstances(String),

    #[error("service discovery failed: {0}")]
    Discovery(String),

    #[error("load tracker error: {0}")]
    Tracker(String),

    #[error("failed to select best instance for {0}")]
    NoSelection(String),
}

pub type BalancerResult<T> = Result<T, BalancerError>;

/// A healthy instance returned by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub address: String,
    pub port: u16,
}

impl ServiceInstance {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// `host:port` form used as the backend key.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Lookup of healthy instances by service name. An empty list is a valid
/// answer meaning "temporarily unavailable".
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    async fn discover(&self, service_name: &str) -> BalancerResult<Vec<ServiceInstance>>;
}

pub type DynServiceDiscovery = Arc<dyn ServiceDiscovery>;

/// Atomic load accounting for backend instances.
#[async_trait]
pub trait LoadTracker: Send + Sync {
    /// Pick one of `candidates` for `model` and increment its load, in a
    /// single atomic step. See [`pick_candidate`] for the selection rule.
    async fn select_and_acquire(&self, model: &str, candidates: &[String]) -> BalancerResult<String>;

    /// Decrement the load of `address` under `model` by one. Tolerates a
    /// missing record.
    async fn release(&self, model: &str, address: &str) -> BalancerResult<()>;

    /// Current recorded load, `None` if unrecorded.
    async fn load_of(&self, model: &str, address: &str) -> BalancerResult<Option<f64>>;
}

pub type DynLoadTracker = Arc<dyn LoadTracker>;

/// Selection rule shared by every tracker.
///
/// Candidates are scanned in order. The first one whose load is unrecorded
/// or zero wins immediately. Otherwise the minimum recorded load wins, ties
/// going to the earliest candidate. Returns the index of the winner, or
/// `None` for an empty slice.
pub fn pick_candidate<F>(candidates: &[String], mut load_of: F) -> Option<usize>
where
    F: FnMut(&str) -> Option<f64>,
{
    let mut best: Option<(usize, f64)> = None;
    for (idx, candidate) in candidates.iter().enumerate() {
        let load = match load_of(candidate) {
            None => return Some(idx),
            Some(load) if load == 0.0 => return Some(idx),
            Some(load) => load,
        };
        match best {
            Some((_, min)) if load >= min => {}
            _ => best = Some((idx, load)),
        }
    }
    best.map(|(idx, _)| idx)
}
