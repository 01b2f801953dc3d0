//! Request and match counters.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Receives progress updates from work items of any invocation.
pub trait Progress: Send + Sync {
    fn add_requests(&self, n: u64);
    fn request_done(&self);
    fn matched(&self);
    fn errored(&self);
    fn snapshot(&self) -> ProgressSnapshot;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub requests_total: u64,
    pub requests_done: u64,
    pub matched: u64,
    pub errors: u64,
}

impl ProgressSnapshot {
    /// Completion in percent, 0 when nothing was scheduled.
    pub fn percent(&self) -> u8 {
        if self.requests_total == 0 {
            return 0;
        }
        let pct = self.requests_done.saturating_mul(100) / self.requests_total;
        pct.min(100) as u8
    }
}

/// Lock-free counters.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    requests_total: AtomicU64,
    requests_done: AtomicU64,
    matched: AtomicU64,
    errors: AtomicU64,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Progress for ProgressTracker {
    fn add_requests(&self, n: u64) {
        self.requests_total.fetch_add(n, Ordering::Relaxed);
    }

    fn request_done(&self) {
        self.requests_done.fetch_add(1, Ordering::Relaxed);
    }

    fn matched(&self) {
        self.matched.fetch_add(1, Ordering::Relaxed);
    }

    fn errored(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_done: self.requests_done.load(Ordering::Relaxed),
            matched: self.matched.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Engine-wide counters plus, optionally, counters of a single invocation.
/// Every update goes to both; `snapshot` reports the invocation's own
/// counters when it has them.
#[derive(Clone)]
pub struct ScopedProgress {
    engine: Arc<dyn Progress>,
    invocation: Option<Arc<dyn Progress>>,
}

impl ScopedProgress {
    pub fn new(engine: Arc<dyn Progress>) -> Self {
        Self {
            engine,
            invocation: None,
        }
    }

    pub fn with_invocation(mut self, invocation: Arc<dyn Progress>) -> Self {
        self.invocation = Some(invocation);
        self
    }

    fn each(&self, f: impl Fn(&dyn Progress)) {
        f(self.engine.as_ref());
        if let Some(own) = &self.invocation {
            f(own.as_ref());
        }
    }
}

impl Progress for ScopedProgress {
    fn add_requests(&self, n: u64) {
        self.each(|p| p.add_requests(n));
    }

    fn request_done(&self) {
        self.each(|p| p.request_done());
    }

    fn matched(&self) {
        self.each(|p| p.matched());
    }

    fn errored(&self) {
        self.each(|p| p.errored());
    }

    fn snapshot(&self) -> ProgressSnapshot {
        self.invocation
            .as_ref()
            .unwrap_or(&self.engine)
            .snapshot()
    }
}
