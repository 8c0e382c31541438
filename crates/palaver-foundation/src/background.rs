//! 后台任务池
//! Background task pool
//!
//! Fire-and-forget jobs (cache repopulation, assistant-turn saves, backend
//! load release) run here instead of bare `tokio::spawn` so shutdown can
//! wait for them and their concurrency stays bounded.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct BackgroundTasks {
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
    idle: Arc<IdleSignal>,
}

/// Count of unfinished jobs, signalled when it drops to zero.
#[derive(Default)]
struct IdleSignal {
    active: AtomicUsize,
    notify: Notify,
}

/// Decrements the job count when the job ends, however it ends.
struct JobGuard(Arc<IdleSignal>);

impl Drop for JobGuard {
    fn drop(&mut self) {
        if self.0.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.notify.notify_waiters();
        }
    }
}

impl BackgroundTasks {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            tracker: TaskTracker::new(),
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            idle: Arc::new(IdleSignal::default()),
        }
    }

    /// Submit a job. Jobs submitted after [`shutdown`](Self::shutdown) are dropped.
    pub fn spawn<F>(&self, name: &'static str, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tracker.is_closed() {
            debug!(job = name, "background pool closed, dropping job");
            return;
        }
        let permits = self.permits.clone();
        self.idle.active.fetch_add(1, Ordering::AcqRel);
        let guard = JobGuard(self.idle.clone());
        self.tracker.spawn(async move {
            let _guard = guard;
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            job.await;
        });
    }

    /// Jobs submitted and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Wait until no job is in flight, leaving the pool open.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a job finishing in between is not missed.
            notified.as_mut().enable();
            if self.idle.active.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting jobs and wait up to `timeout` for in-flight ones.
    /// Returns `false` if the timeout elapsed first.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.tracker.close();
        let drained = tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok();
        if !drained {
            warn!(pending = self.tracker.len(), "background jobs still running at shutdown");
        }
        drained
    }
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new(64)
    }
}
