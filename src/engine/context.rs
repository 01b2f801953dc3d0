//! The per-invocation execution context.
//!
//! Every call to [`ThreadSafeEngine::execute`](super::facade::ThreadSafeEngine::execute)
//! builds one of these from the engine's shared handles plus the
//! invocation's own options. It owns everything an invocation may mutate
//! (rate limiter, resume state, cancellation) and is dropped when the call
//! returns, so two invocations never observe each other's state.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tracing::{debug, warn};

use super::{ResultCallback, SharedContext};
use crate::catalog::Catalog;
use crate::hosterrors::HostErrorCache;
use crate::interactions::InteractionClient;
use crate::options::ScanOptions;
use crate::output::{Colorizer, FailureEvent, OutputWriter, ResultEvent};
use crate::progress::{Progress, ScopedProgress};
use crate::ratelimit::RateLimiter;

/// Template × target pairs already completed in this invocation.
#[derive(Debug, Default)]
pub struct ResumeState {
    done: Mutex<HashSet<(String, String)>>,
}

impl ResumeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self, template: &str, target: &str) -> bool {
        self.done
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&(template.to_string(), target.to_string()))
    }

    pub fn mark_done(&self, template: &str, target: &str) {
        self.done
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((template.to_string(), target.to_string()));
    }

    pub fn len(&self) -> usize {
        self.done.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

static NEXT_INVOCATION: AtomicU64 = AtomicU64::new(1);

/// A process-wide unique invocation id.
pub(crate) fn next_invocation_id() -> u64 {
    NEXT_INVOCATION.fetch_add(1, Ordering::Relaxed)
}

pub struct ExecutionContext {
    id: u64,
    pub(crate) options: ScanOptions,
    pub(crate) catalog: Arc<dyn Catalog>,
    output: Arc<dyn OutputWriter>,
    progress: ScopedProgress,
    interactions: Arc<dyn InteractionClient>,
    host_errors: Arc<HostErrorCache>,
    callbacks: Arc<[ResultCallback]>,
    rate_limiter: Arc<RateLimiter>,
    resume: ResumeState,
    colorizer: Colorizer,
    cancel: watch::Receiver<bool>,
}

impl ExecutionContext {
    /// Build a context with a fresh rate limiter derived from `options`.
    pub fn new(shared: &SharedContext, options: ScanOptions) -> Self {
        let limiter = Arc::new(RateLimiter::from_options(&options));
        Self::with_limiter(shared, options, limiter)
    }

    pub(crate) fn with_limiter(
        shared: &SharedContext,
        options: ScanOptions,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        Self::for_invocation(next_invocation_id(), shared, options, rate_limiter)
    }

    pub(crate) fn for_invocation(
        id: u64,
        shared: &SharedContext,
        options: ScanOptions,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        // Never flips: the sender is dropped right away.
        let (_, cancel) = watch::channel(false);
        let colorizer = Colorizer::new(!options.no_color);
        Self {
            id,
            options,
            catalog: Arc::clone(&shared.catalog),
            output: Arc::clone(&shared.output),
            progress: ScopedProgress::new(Arc::clone(&shared.progress)),
            interactions: Arc::clone(&shared.interactions),
            host_errors: Arc::clone(&shared.host_errors),
            callbacks: Arc::clone(&shared.callbacks),
            rate_limiter,
            resume: ResumeState::new(),
            colorizer,
            cancel,
        }
    }

    /// Tie this invocation to a cancellation signal. Only this context
    /// watches it.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Also count this invocation's requests and matches into `progress`.
    pub fn with_progress(mut self, progress: Arc<dyn Progress>) -> Self {
        self.progress = self.progress.with_invocation(progress);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn resume(&self) -> &ResumeState {
        &self.resume
    }

    pub fn colorizer(&self) -> Colorizer {
        self.colorizer
    }

    pub fn host_errors(&self) -> &HostErrorCache {
        &self.host_errors
    }

    pub fn progress(&self) -> &dyn Progress {
        &self.progress
    }

    pub fn interactions(&self) -> &dyn InteractionClient {
        self.interactions.as_ref()
    }

    /// The interaction correlation for one template against one target,
    /// e.g. `7-https-example-com-app-git-config`. Unique per invocation.
    pub fn correlation(&self, target: &str, template_id: &str) -> String {
        let mut slug = String::with_capacity(target.len());
        for c in target.chars() {
            if c.is_ascii_alphanumeric() {
                slug.push(c.to_ascii_lowercase());
            } else if !slug.is_empty() && !slug.ends_with('-') {
                slug.push('-');
            }
        }
        let slug = slug.trim_end_matches('-');
        format!("{}-{}-{}", self.id, slug, template_id)
    }

    /// Whether the host error cache blocks `target` at this invocation's
    /// `max_host_errors`.
    pub fn host_blocked(&self, target: &str) -> bool {
        self.host_errors.is_blocked(target, self.options.max_host_errors)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once the invocation is cancelled; never resolves if the
    /// signal's sender went away without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Deliver a match to the output writer and every result callback.
    pub fn emit(&self, event: ResultEvent) {
        self.progress.matched();
        if let Err(e) = self.output.write(&event) {
            warn!(template = %event.template_id, error = %e, "failed to write result");
        }
        for callback in self.callbacks.iter() {
            callback(&event);
        }
    }

    /// Record a failed template × target evaluation. Never aborts the scan.
    pub fn emit_failure(&self, event: FailureEvent) {
        debug!(template = %event.template_id, host = %event.host, error = %event.error, "evaluation failed");
        self.progress.errored();
        if let Err(e) = self.output.write_failure(&event) {
            warn!(template = %event.template_id, error = %e, "failed to write failure");
        }
    }
}
