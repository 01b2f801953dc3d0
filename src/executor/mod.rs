pub mod http;
pub mod mock;

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::error;

use crate::engine::ExecutionContext;
use crate::input::InputProvider;
use crate::template::{Template, Workflow};

/// Runs templates against targets for exactly one invocation.
///
/// `run_scan` schedules the work and may return before it completes;
/// `wait` returns once every scheduled work item is done. Errors of
/// individual work items go through the context's output channel, never
/// through these return values.
#[async_trait]
pub trait ScanExecutor: Send {
    /// Returns whether any work was scheduled. `dedupe` lets templates that
    /// send identical requests share one request per target.
    async fn run_scan(
        &mut self,
        templates: &[Arc<Template>],
        workflows: &[Arc<Workflow>],
        inputs: &InputProvider,
        dedupe: bool,
    ) -> Result<bool>;

    async fn wait(&mut self);
}

/// Builds a fresh executor bound to one invocation's context.
pub trait ExecutorFactory: Send + Sync {
    fn create(&self, ctx: Arc<ExecutionContext>) -> Box<dyn ScanExecutor>;
}

/// Spawned work items, at most `size` of them running at once.
pub struct WorkPool {
    tasks: JoinSet<()>,
    permits: Arc<Semaphore>,
}

impl WorkPool {
    pub fn new(size: usize) -> Self {
        Self {
            tasks: JoinSet::new(),
            permits: Arc::new(Semaphore::new(size.max(1))),
        }
    }

    pub fn spawn<F>(&mut self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        self.tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            work.await;
        });
    }

    /// Work items spawned and not yet collected by `wait`.
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Block until every spawned work item finished.
    pub async fn wait(&mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "work item panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn wait_drains_everything() {
        let done = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkPool::new(4);
        for _ in 0..10 {
            let done = Arc::clone(&done);
            pool.spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(pool.pending(), 10);
        pool.wait().await;
        assert_eq!(done.load(Ordering::SeqCst), 10);
        assert_eq!(pool.pending(), 0);
    }

    #[tokio::test]
    async fn size_bounds_parallelism() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkPool::new(2);
        for _ in 0..8 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            pool.spawn(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }
        pool.wait().await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn panicking_item_does_not_stop_drain() {
        let done = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkPool::new(2);
        pool.spawn(async { panic!("boom") });
        let counter = Arc::clone(&done);
        pool.spawn(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let start = Instant::now();
        pool.wait().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
