//! The scan engine in its two phases.
//!
//! [`EngineBuilder`] is the setup phase: it owns the shared handles and
//! exposes the operations that must not race with scans (loading the
//! default template set, replacing result callbacks). Freezing it yields
//! either a [`ThreadSafeEngine`] that any number of tasks can drive at
//! once, or a single-shot [`Engine`] for plain sequential use. Neither
//! frozen form can reach the setup operations again.

pub mod context;
pub mod facade;

use std::sync::Arc;

use tracing::{debug, info};

use crate::catalog::{Catalog, DirCatalog};
use crate::consts::default_templates_dir;
use crate::error::ScanError;
use crate::executor::ExecutorFactory;
use crate::executor::http::HttpExecutorFactory;
use crate::hosterrors::HostErrorCache;
use crate::input::InputProvider;
use crate::interactions::{InteractionClient, NoopInteractions};
use crate::loader::{CatalogLoader, TemplateLoader, TemplateStore};
use crate::options::{self, ScanOption, ScanOptions};
use crate::output::{Colorizer, ConsoleWriter, OutputWriter, ResultEvent};
use crate::progress::{Progress, ProgressSnapshot, ProgressTracker};
use crate::ratelimit::RateLimiter;

pub use context::ExecutionContext;
pub use facade::{InvocationHooks, ThreadSafeEngine};

/// Called once per match, from whichever task found it.
pub type ResultCallback = Arc<dyn Fn(&ResultEvent) + Send + Sync>;

/// Which frozen form an engine took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    SingleShot,
    Concurrent,
}

/// Where one invocation currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    Configuring,
    Loading,
    Validating,
    Executing,
    Draining,
    Done,
    Failed,
}

/// Handles every invocation of a frozen engine reads. Nothing here changes
/// after freezing; mutable per-scan state lives in [`ExecutionContext`].
#[derive(Clone)]
pub struct SharedContext {
    pub(crate) base_options: ScanOptions,
    pub(crate) catalog: Arc<dyn Catalog>,
    pub(crate) output: Arc<dyn OutputWriter>,
    pub(crate) progress: Arc<dyn Progress>,
    pub(crate) interactions: Arc<dyn InteractionClient>,
    pub(crate) host_errors: Arc<HostErrorCache>,
    pub(crate) callbacks: Arc<[ResultCallback]>,
    pub(crate) loader: Arc<dyn TemplateLoader>,
    pub(crate) executors: Arc<dyn ExecutorFactory>,
    pub(crate) mode: EngineMode,
}

impl SharedContext {
    pub fn base_options(&self) -> &ScanOptions {
        &self.base_options
    }

    pub fn mode(&self) -> EngineMode {
        self.mode
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    /// Flush the output writer and release the interaction client.
    pub(crate) fn close(&self) -> anyhow::Result<()> {
        self.interactions.close();
        self.output.close()
    }
}

/// Setup phase of an engine.
pub struct EngineBuilder {
    options: ScanOptions,
    catalog: Arc<dyn Catalog>,
    output: Option<Arc<dyn OutputWriter>>,
    progress: Arc<dyn Progress>,
    interactions: Arc<dyn InteractionClient>,
    loader: Arc<dyn TemplateLoader>,
    executors: Arc<dyn ExecutorFactory>,
    callbacks: Vec<ResultCallback>,
    store: Option<TemplateStore>,
}

impl EngineBuilder {
    /// Apply `options` in order to the defaults. The first failing option
    /// aborts construction.
    pub fn new(options: impl IntoIterator<Item = ScanOption>) -> Result<Self, ScanError> {
        let mut base = ScanOptions::default();
        options::apply(&mut base, options)?;
        Ok(Self {
            options: base,
            catalog: Arc::new(DirCatalog::new(default_templates_dir())),
            output: None,
            progress: Arc::new(ProgressTracker::new()),
            interactions: Arc::new(NoopInteractions),
            loader: Arc::new(CatalogLoader),
            executors: Arc::new(HttpExecutorFactory),
            callbacks: Vec::new(),
            store: None,
        })
    }

    pub fn catalog(mut self, catalog: Arc<dyn Catalog>) -> Self {
        self.catalog = catalog;
        self
    }

    /// Defaults to colored console output on stdout.
    pub fn output(mut self, output: Arc<dyn OutputWriter>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn progress(mut self, progress: Arc<dyn Progress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn interactions(mut self, interactions: Arc<dyn InteractionClient>) -> Self {
        self.interactions = interactions;
        self
    }

    pub fn loader(mut self, loader: Arc<dyn TemplateLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn executors(mut self, executors: Arc<dyn ExecutorFactory>) -> Self {
        self.executors = executors;
        self
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    /// Replace every result callback with `callback`.
    pub fn set_result_callback<F>(&mut self, callback: F)
    where
        F: Fn(&ResultEvent) + Send + Sync + 'static,
    {
        let callback: ResultCallback = Arc::new(callback);
        self.callbacks = vec![callback];
    }

    /// Load the default template set, filtered by the base options. Used
    /// by the single-shot engine.
    pub async fn load_all_templates(&mut self) -> Result<usize, ScanError> {
        let shared = self.shared(EngineMode::SingleShot);
        let ctx = ExecutionContext::new(&shared, self.options.clone());
        let store = shared.loader.load(&ctx).await.map_err(ScanError::Loader)?;
        let count = store.templates().len() + store.workflows().len();
        info!(
            templates = store.templates().len(),
            workflows = store.workflows().len(),
            "templates loaded"
        );
        self.store = Some(store);
        Ok(count)
    }

    pub(crate) fn shared(&self, mode: EngineMode) -> SharedContext {
        let output: Arc<dyn OutputWriter> = match &self.output {
            Some(output) => Arc::clone(output),
            None => Arc::new(ConsoleWriter::stdout(Colorizer::new(!self.options.no_color))),
        };
        SharedContext {
            base_options: self.options.clone(),
            catalog: Arc::clone(&self.catalog),
            output,
            progress: Arc::clone(&self.progress),
            interactions: Arc::clone(&self.interactions),
            host_errors: Arc::new(HostErrorCache::new()),
            callbacks: self.callbacks.clone().into(),
            loader: Arc::clone(&self.loader),
            executors: Arc::clone(&self.executors),
            mode,
        }
    }

    /// Freeze into an engine that serves concurrent invocations.
    pub fn build(self) -> ThreadSafeEngine {
        ThreadSafeEngine::new(self.shared(EngineMode::Concurrent))
    }

    /// Freeze into a sequential engine over the loaded template set.
    pub fn single_shot(self) -> Engine {
        let shared = self.shared(EngineMode::SingleShot);
        let limiter = Arc::new(RateLimiter::from_options(&shared.base_options));
        Engine {
            shared,
            store: self.store,
            limiter,
        }
    }
}

/// A sequential engine. `execute` takes `&mut self`, so the borrow checker
/// rules out overlapping runs; the rate limiter is shared by every run.
pub struct Engine {
    shared: SharedContext,
    store: Option<TemplateStore>,
    limiter: Arc<RateLimiter>,
}

impl Engine {
    pub fn mode(&self) -> EngineMode {
        self.shared.mode
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.shared.progress()
    }

    /// Run the loaded templates against `targets`. Templates are loaded
    /// with the base options first if `load_all_templates` was never called.
    pub async fn execute<S: AsRef<str> + Sync>(&mut self, targets: &[S]) -> Result<(), ScanError> {
        let ctx = Arc::new(ExecutionContext::with_limiter(
            &self.shared,
            self.shared.base_options.clone(),
            Arc::clone(&self.limiter),
        ));

        let store = match &self.store {
            Some(store) => store.clone(),
            None => {
                let store = self
                    .shared
                    .loader
                    .load(&ctx)
                    .await
                    .map_err(ScanError::Loader)?;
                self.store = Some(store.clone());
                store
            }
        };

        let inputs: InputProvider = targets.iter().map(|t| t.as_ref()).collect();
        if inputs.count() == 0 {
            return Err(ScanError::NoTargetsAvailable);
        }
        if store.is_empty() {
            return Err(ScanError::NoTemplatesAvailable);
        }

        let mut executor = self.shared.executors.create(Arc::clone(&ctx));
        if let Err(e) = executor
            .run_scan(store.templates(), store.workflows(), &inputs, false)
            .await
        {
            debug!(error = %e, "scan did not start cleanly");
        }
        executor.wait().await;
        Ok(())
    }

    pub fn close(self) -> anyhow::Result<()> {
        self.shared.close()
    }
}
