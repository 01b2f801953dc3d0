use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use super::{ExecutorFactory, ScanExecutor, WorkPool};
use crate::engine::ExecutionContext;
use crate::input::InputProvider;
use crate::options::ScanOptions;
use crate::output::{FailureEvent, ResultEvent, now_ms};
use crate::ratelimit::Quota;
use crate::template::{Template, Workflow};

/// What one mock executor saw when `run_scan` was called.
#[derive(Debug, Clone)]
pub struct Observation {
    pub targets: Vec<String>,
    pub quota: Quota,
    pub options: ScanOptions,
    pub templates: Vec<String>,
    pub workflows: Vec<String>,
    pub dedupe: bool,
}

/// A scripted executor for tests. Every template × target pair "matches"
/// after `delay`, except for targets marked as failing, which produce a
/// failure record instead.
#[derive(Debug, Default)]
pub struct MockExecutorFactory {
    delay: Duration,
    failing: HashSet<String>,
    created: AtomicUsize,
    observations: Arc<Mutex<Vec<Observation>>>,
}

impl MockExecutorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_on(mut self, target: impl Into<String>) -> Self {
        self.failing.insert(target.into());
        self
    }

    /// How many executors were handed out.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn observations(&self) -> Vec<Observation> {
        self.observations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ExecutorFactory for MockExecutorFactory {
    fn create(&self, ctx: Arc<ExecutionContext>) -> Box<dyn ScanExecutor> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let pool = WorkPool::new(ctx.options().concurrency);
        Box::new(MockExecutor {
            ctx,
            delay: self.delay,
            failing: Arc::new(self.failing.clone()),
            observations: Arc::clone(&self.observations),
            pool,
        })
    }
}

pub struct MockExecutor {
    ctx: Arc<ExecutionContext>,
    delay: Duration,
    failing: Arc<HashSet<String>>,
    observations: Arc<Mutex<Vec<Observation>>>,
    pool: WorkPool,
}

#[async_trait]
impl ScanExecutor for MockExecutor {
    async fn run_scan(
        &mut self,
        templates: &[Arc<Template>],
        workflows: &[Arc<Workflow>],
        inputs: &InputProvider,
        dedupe: bool,
    ) -> Result<bool> {
        self.observations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Observation {
                targets: inputs.iter().map(str::to_string).collect(),
                quota: self.ctx.rate_limiter().quota(),
                options: self.ctx.options().clone(),
                templates: templates.iter().map(|t| t.id.clone()).collect(),
                workflows: workflows.iter().map(|w| w.id.clone()).collect(),
                dedupe,
            });

        let mut scheduled = false;
        for target in inputs.iter() {
            for template in templates {
                let ctx = Arc::clone(&self.ctx);
                let failing = Arc::clone(&self.failing);
                let template = Arc::clone(template);
                let target = target.to_string();
                let delay = self.delay;
                self.pool.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if failing.contains(&target) {
                        ctx.emit_failure(FailureEvent {
                            template_id: template.id.clone(),
                            host: target,
                            error: "mock failure".to_string(),
                            timestamp_ms: now_ms(),
                        });
                        return;
                    }
                    ctx.resume().mark_done(&template.id, &target);
                    ctx.emit(ResultEvent {
                        template_id: template.id.clone(),
                        template_name: template.info.name.clone(),
                        severity: template.info.severity,
                        host: target.clone(),
                        matched_at: target,
                        matcher_names: Vec::new(),
                        workflow: None,
                        timestamp_ms: now_ms(),
                    });
                });
                scheduled = true;
            }
        }
        Ok(scheduled)
    }

    async fn wait(&mut self) {
        self.pool.wait().await;
    }
}
