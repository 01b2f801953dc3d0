//! The engine handle that serves concurrent invocations.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{Instrument, debug, info, info_span, warn};

use super::context::next_invocation_id;
use super::{ExecutionContext, InvocationState, SharedContext};
use crate::error::ScanError;
use crate::input::InputProvider;
use crate::options::{self, ScanOption, ScanOptions};
use crate::progress::{Progress, ProgressSnapshot};
use crate::ratelimit::RateLimiter;

/// Per-call extras for [`ThreadSafeEngine::execute_with`].
#[derive(Default)]
pub struct InvocationHooks {
    /// Stop issuing requests once this turns `true`.
    pub cancel: Option<watch::Receiver<bool>>,
    /// Counters for this invocation alone, on top of the engine-wide ones.
    pub progress: Option<Arc<dyn Progress>>,
}

/// A frozen engine whose `execute` may be called from many tasks at once,
/// typically through an `Arc<ThreadSafeEngine>`.
///
/// Each invocation clones the base options, applies its own option
/// functions, and gets a fresh rate limiter and executor. The output
/// writer, progress tracker, catalog, interaction client and host error
/// cache are shared, which is why their traits require `Send + Sync`.
/// The engine itself takes no locks.
pub struct ThreadSafeEngine {
    shared: SharedContext,
}

impl ThreadSafeEngine {
    pub(crate) fn new(shared: SharedContext) -> Self {
        Self { shared }
    }

    pub fn options(&self) -> &ScanOptions {
        self.shared.base_options()
    }

    pub fn shared(&self) -> &SharedContext {
        &self.shared
    }

    /// Counters summed over every invocation so far.
    pub fn progress(&self) -> ProgressSnapshot {
        self.shared.progress()
    }

    /// Scan `targets` with the engine's base options overridden by `options`.
    ///
    /// Returns once every work item of this invocation has finished; other
    /// invocations running at the same time are not waited for. Only setup
    /// failures are returned. Failures of individual template × target
    /// evaluations are written to the output as failure records.
    pub async fn execute<S>(
        &self,
        targets: &[S],
        options: Vec<ScanOption>,
    ) -> Result<(), ScanError>
    where
        S: AsRef<str> + Sync,
    {
        self.execute_with(targets, options, InvocationHooks::default())
            .await
    }

    /// Like [`execute`](Self::execute), but stops issuing new requests once
    /// `cancel` turns `true`. The call still returns only after in-flight
    /// work drained.
    pub async fn execute_with_cancel<S>(
        &self,
        targets: &[S],
        options: Vec<ScanOption>,
        cancel: watch::Receiver<bool>,
    ) -> Result<(), ScanError>
    where
        S: AsRef<str> + Sync,
    {
        let hooks = InvocationHooks {
            cancel: Some(cancel),
            ..Default::default()
        };
        self.execute_with(targets, options, hooks).await
    }

    /// [`execute`](Self::execute) with optional cancellation and
    /// per-invocation progress.
    pub async fn execute_with<S>(
        &self,
        targets: &[S],
        options: Vec<ScanOption>,
        hooks: InvocationHooks,
    ) -> Result<(), ScanError>
    where
        S: AsRef<str> + Sync,
    {
        let id = next_invocation_id();
        let span = info_span!("invocation", id, targets = targets.len());
        async move {
            let result = self.run(id, targets, options, hooks).await;
            match &result {
                Ok(()) => debug!(state = ?InvocationState::Done, "invocation finished"),
                Err(e) => {
                    warn!(state = ?InvocationState::Failed, error = %e, "invocation failed")
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run<S>(
        &self,
        id: u64,
        targets: &[S],
        overrides: Vec<ScanOption>,
        hooks: InvocationHooks,
    ) -> Result<(), ScanError>
    where
        S: AsRef<str> + Sync,
    {
        debug!(state = ?InvocationState::Configuring);
        let mut invocation_options = self.shared.base_options.clone();
        options::apply(&mut invocation_options, overrides)?;

        let limiter = Arc::new(RateLimiter::from_options(&invocation_options));
        let mut ctx =
            ExecutionContext::for_invocation(id, &self.shared, invocation_options, limiter);
        if let Some(cancel) = hooks.cancel {
            ctx = ctx.with_cancel(cancel);
        }
        if let Some(progress) = hooks.progress {
            ctx = ctx.with_progress(progress);
        }
        let ctx = Arc::new(ctx);

        debug!(state = ?InvocationState::Loading);
        let store = self
            .shared
            .loader
            .load(&ctx)
            .await
            .map_err(ScanError::Loader)?;

        let inputs: InputProvider = targets.iter().map(|t| t.as_ref()).collect();

        debug!(state = ?InvocationState::Validating);
        if inputs.count() == 0 {
            return Err(ScanError::NoTargetsAvailable);
        }
        if store.is_empty() {
            return Err(ScanError::NoTemplatesAvailable);
        }

        debug!(
            state = ?InvocationState::Executing,
            templates = store.templates().len(),
            workflows = store.workflows().len()
        );
        let mut executor = self.shared.executors.create(Arc::clone(&ctx));
        match executor
            .run_scan(store.templates(), store.workflows(), &inputs, false)
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!("executor scheduled no work"),
            Err(e) => warn!(error = %format!("{e:#}"), "scan reported an error"),
        }

        debug!(state = ?InvocationState::Draining);
        executor.wait().await;
        info!(completed = ctx.resume().len(), "invocation drained");
        Ok(())
    }

    /// Flush output and release shared handles.
    ///
    /// Consumes the engine, so it cannot run while any invocation still
    /// borrows it. Callers sharing the engine through an `Arc` reclaim it
    /// with `Arc::into_inner` once every task holding a clone has finished.
    pub fn close(self) -> anyhow::Result<()> {
        self.shared.close()
    }
}
