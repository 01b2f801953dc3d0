//! Default executor: template requests over HTTP with reqwest.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::{Client, Method};
use tracing::{debug, warn};

use super::{ExecutorFactory, ScanExecutor, WorkPool};
use crate::consts::{BASE_URL_PLACEHOLDER, INTERACTION_PLACEHOLDER};
use crate::engine::ExecutionContext;
use crate::input::InputProvider;
use crate::output::{FailureEvent, ResultEvent, now_ms};
use crate::template::{HttpRequest, ResponseView, Template, Workflow, WorkflowNode};

/// Creates an [`HttpExecutor`] per invocation.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpExecutorFactory;

impl ExecutorFactory for HttpExecutorFactory {
    fn create(&self, ctx: Arc<ExecutionContext>) -> Box<dyn ScanExecutor> {
        Box::new(HttpExecutor::new(ctx))
    }
}

/// The URL `{{BaseURL}}` expands to. Targets without a scheme get `http://`.
pub fn base_url(target: &str) -> String {
    let trimmed = target.trim().trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

/// Group templates whose request lists are identical. Without `dedupe`
/// every template forms its own group. Templates that embed an interaction
/// URL always stand alone so each keeps its own correlation.
pub fn cluster(templates: &[Arc<Template>], dedupe: bool) -> Vec<Vec<Arc<Template>>> {
    if !dedupe {
        return templates.iter().map(|t| vec![Arc::clone(t)]).collect();
    }
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut clusters: Vec<Vec<Arc<Template>>> = Vec::new();
    for template in templates {
        let key = template
            .http
            .iter()
            .map(HttpRequest::signature)
            .collect::<Vec<_>>()
            .join("\n");
        if key.contains(INTERACTION_PLACEHOLDER) {
            clusters.push(vec![Arc::clone(template)]);
            continue;
        }
        match slots.get(&key) {
            Some(&slot) => clusters[slot].push(Arc::clone(template)),
            None => {
                slots.insert(key, clusters.len());
                clusters.push(vec![Arc::clone(template)]);
            }
        }
    }
    clusters
}

/// What one spawned work item needs. Cheap to clone.
#[derive(Clone)]
struct Worker {
    ctx: Arc<ExecutionContext>,
    client: Client,
}

impl Worker {
    fn render(&self, raw: &str, target: &str, template_id: &str) -> String {
        let mut out = raw.replace(BASE_URL_PLACEHOLDER, &base_url(target));
        if out.contains(INTERACTION_PLACEHOLDER)
            && let Some(url) = self
                .ctx
                .interactions()
                .url(&self.ctx.correlation(target, template_id))
        {
            out = out.replace(INTERACTION_PLACEHOLDER, &url);
        }
        out
    }

    /// Send one request, retrying as configured. `Ok(None)` means the
    /// invocation was cancelled before a response arrived.
    async fn send(
        &self,
        request: &HttpRequest,
        url: &str,
        target: &str,
        template_id: &str,
    ) -> Result<Option<ResponseView>> {
        let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .with_context(|| format!("invalid http method {}", request.method))?;
        let attempts = self.ctx.options().retries + 1;
        let mut last_error = None;

        for attempt in 1..=attempts {
            tokio::select! {
                _ = self.ctx.cancelled() => return Ok(None),
                _ = self.ctx.rate_limiter().take() => {}
            }

            let mut builder = self.client.request(method.clone(), url);
            for (name, value) in &self.ctx.options().headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), self.render(value, target, template_id));
            }
            if let Some(body) = &request.body {
                builder = builder.body(self.render(body, target, template_id));
            }

            let sent = tokio::select! {
                _ = self.ctx.cancelled() => return Ok(None),
                sent = builder.send() => sent,
            };
            match sent {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let headers = response
                        .headers()
                        .iter()
                        .map(|(k, v)| format!("{}: {}", k, String::from_utf8_lossy(v.as_bytes())))
                        .collect::<Vec<_>>()
                        .join("\n");
                    match response.text().await {
                        Ok(body) => {
                            return Ok(Some(ResponseView {
                                status,
                                headers,
                                body,
                            }));
                        }
                        Err(e) => last_error = Some(anyhow!(e).context("failed to read body")),
                    }
                }
                Err(e) => {
                    debug!(url, attempt, error = %e, "request failed");
                    last_error = Some(anyhow!(e));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("request to {url} was never sent")))
    }

    /// Run a group of templates that share their requests against one
    /// target. Returns the ids of templates that matched.
    async fn run(
        &self,
        group: &[Arc<Template>],
        target: &str,
        workflow: Option<&str>,
    ) -> Vec<String> {
        let resume_key = |t: &Template| match workflow {
            Some(w) => format!("{w}:{}", t.id),
            None => t.id.clone(),
        };
        let pending: Vec<&Arc<Template>> = group
            .iter()
            .filter(|t| !self.ctx.resume().is_done(&resume_key(t), target))
            .collect();
        let Some(lead) = pending.first() else {
            return Vec::new();
        };

        let mut matched: Vec<String> = Vec::new();
        let mut finished = true;

        'requests: for (index, request) in lead.http.iter().enumerate() {
            for path in &request.path {
                if self.ctx.is_cancelled() {
                    finished = false;
                    break 'requests;
                }
                if self.ctx.host_blocked(target) {
                    debug!(target, template = %lead.id, "host skipped after repeated errors");
                    break 'requests;
                }

                let url = self.render(path, target, &lead.id);
                self.ctx.progress().add_requests(1);
                let sent = self.send(request, &url, target, &lead.id).await;
                self.ctx.progress().request_done();

                let response = match sent {
                    Ok(Some(response)) => response,
                    Ok(None) => {
                        finished = false;
                        break 'requests;
                    }
                    Err(e) => {
                        self.ctx.host_errors().mark_failed(target);
                        for template in &pending {
                            self.ctx.emit_failure(FailureEvent {
                                template_id: template.id.clone(),
                                host: target.to_string(),
                                error: format!("{e:#}"),
                                timestamp_ms: now_ms(),
                            });
                        }
                        break 'requests;
                    }
                };

                for template in &pending {
                    if matched.contains(&template.id) {
                        continue;
                    }
                    let Some(own) = template.http.get(index) else {
                        continue;
                    };
                    if let Some(matcher_names) = own.evaluate(&response) {
                        let c = self.ctx.colorizer();
                        debug!(
                            "{} [{}] {}",
                            c.bold(&template.id),
                            c.severity(template.info.severity),
                            url
                        );
                        matched.push(template.id.clone());
                        self.ctx.emit(ResultEvent {
                            template_id: template.id.clone(),
                            template_name: template.info.name.clone(),
                            severity: template.info.severity,
                            host: target.to_string(),
                            matched_at: url.clone(),
                            matcher_names,
                            workflow: workflow.map(str::to_string),
                            timestamp_ms: now_ms(),
                        });
                    }
                }
            }
        }

        if finished {
            for template in &pending {
                self.ctx.resume().mark_done(&resume_key(template), target);
            }
        }
        matched
    }

    /// Run workflow nodes in order; subtemplates only follow a match.
    fn run_nodes<'a>(
        &'a self,
        nodes: &'a [WorkflowNode],
        target: &'a str,
        workflow: &'a str,
    ) -> BoxFuture<'a, ()> {
        async move {
            for node in nodes {
                let matched = self
                    .run(std::slice::from_ref(&node.template), target, Some(workflow))
                    .await;
                if !matched.is_empty() && !node.subtemplates.is_empty() {
                    self.run_nodes(&node.subtemplates, target, workflow).await;
                }
            }
        }
        .boxed()
    }
}

/// Sends each template's requests to each target on a bounded work pool.
pub struct HttpExecutor {
    worker: Worker,
    pool: WorkPool,
}

impl HttpExecutor {
    pub fn new(ctx: Arc<ExecutionContext>) -> Self {
        let client = Client::builder()
            .timeout(ctx.options().timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "falling back to default http client");
                Client::new()
            });
        let pool = WorkPool::new(ctx.options().concurrency);
        Self {
            worker: Worker { ctx, client },
            pool,
        }
    }
}

#[async_trait]
impl ScanExecutor for HttpExecutor {
    async fn run_scan(
        &mut self,
        templates: &[Arc<Template>],
        workflows: &[Arc<Workflow>],
        inputs: &InputProvider,
        dedupe: bool,
    ) -> Result<bool> {
        let groups: Vec<Arc<[Arc<Template>]>> = cluster(templates, dedupe)
            .into_iter()
            .map(Into::into)
            .collect();
        let mut scheduled = false;

        for target in inputs.iter() {
            for group in &groups {
                let worker = self.worker.clone();
                let group = Arc::clone(group);
                let target = target.to_string();
                self.pool.spawn(async move {
                    worker.run(&group, &target, None).await;
                });
                scheduled = true;
            }
            for workflow in workflows {
                let worker = self.worker.clone();
                let workflow = Arc::clone(workflow);
                let target = target.to_string();
                self.pool.spawn(async move {
                    worker
                        .run_nodes(&workflow.nodes, &target, &workflow.id)
                        .await;
                });
                scheduled = true;
            }
        }

        debug!(
            groups = groups.len(),
            workflows = workflows.len(),
            targets = inputs.count(),
            dedupe,
            "scan scheduled"
        );
        Ok(scheduled)
    }

    async fn wait(&mut self) {
        self.pool.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{Condition, Info};

    fn template(id: &str, path: &str) -> Arc<Template> {
        Arc::new(Template {
            id: id.to_string(),
            info: Info::default(),
            http: vec![HttpRequest {
                method: "GET".to_string(),
                path: vec![path.to_string()],
                headers: Default::default(),
                body: None,
                matchers_condition: Condition::Or,
                matchers: vec![],
            }],
        })
    }

    #[test]
    fn base_url_adds_scheme_and_trims_slash() {
        assert_eq!(base_url("example.com/"), "http://example.com");
        assert_eq!(base_url("https://example.com/app/"), "https://example.com/app");
    }

    #[test]
    fn cluster_without_dedupe_keeps_templates_apart() {
        let ts = vec![template("a", "{{BaseURL}}/x"), template("b", "{{BaseURL}}/x")];
        assert_eq!(cluster(&ts, false).len(), 2);
    }

    #[test]
    fn cluster_with_dedupe_groups_identical_requests() {
        let ts = vec![
            template("a", "{{BaseURL}}/x"),
            template("b", "{{BaseURL}}/y"),
            template("c", "{{BaseURL}}/x"),
        ];
        let groups = cluster(&ts, true);
        assert_eq!(groups.len(), 2);
        let ids: Vec<_> = groups[0].iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn interaction_templates_are_never_grouped() {
        let ts = vec![
            template("a", "{{BaseURL}}/cb?u={{interaction_url}}"),
            template("b", "{{BaseURL}}/cb?u={{interaction_url}}"),
        ];
        assert_eq!(cluster(&ts, true).len(), 2);
    }
}
