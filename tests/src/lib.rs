//! Palaver Testing Framework
//!
//! Test doubles for the chat backend: fault-injecting storage and queue
//! tiers, a scripted inference connector that runs behind the real
//! [`InferenceGateway`](palaver_foundation::inference::InferenceGateway),
//! a load tracker that records every acquire and release, and a
//! [`TestHarness`] that wires them into a working orchestrator.

pub mod balancer;
pub mod harness;
pub mod inference;
pub mod queue;
pub mod store;

pub use balancer::RecordingTracker;
pub use harness::{HarnessBuilder, TestHarness};
pub use inference::ScriptedConnector;
pub use queue::{FailingPublisher, RecordingPublisher};
pub use store::FlakyStore;

/// Assert the load recorded for a backend, treating "unrecorded" as zero.
#[macro_export]
macro_rules! assert_load {
    ($tracker:expr, $model:expr, $address:expr, $expected:expr) => {
        let load = $tracker.load($model, $address).unwrap_or(0.0);
        assert_eq!(
            load, $expected as f64,
            "load of {} for model {}",
            $address, $model
        );
    };
}
