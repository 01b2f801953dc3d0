//! Resolving the templates and workflows an invocation will run.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::catalog::Catalog;
use crate::engine::context::ExecutionContext;
use crate::options::ScanOptions;
use crate::template::{Document, Info, Template, Workflow, WorkflowNode, WorkflowStep};

/// The templates and workflows resolved for one invocation.
#[derive(Debug, Clone, Default)]
pub struct TemplateStore {
    templates: Vec<Arc<Template>>,
    workflows: Vec<Arc<Workflow>>,
}

impl TemplateStore {
    pub fn new(templates: Vec<Arc<Template>>, workflows: Vec<Arc<Workflow>>) -> Self {
        Self {
            templates,
            workflows,
        }
    }

    pub fn templates(&self) -> &[Arc<Template>] {
        &self.templates
    }

    pub fn workflows(&self) -> &[Arc<Workflow>] {
        &self.workflows
    }

    /// True when there is nothing at all to run.
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty() && self.workflows.is_empty()
    }
}

/// Produces a [`TemplateStore`] from an invocation's options and catalog.
///
/// Loaders are shared across invocations; a call must depend only on the
/// context it is given.
#[async_trait]
pub trait TemplateLoader: Send + Sync {
    async fn load(&self, ctx: &ExecutionContext) -> Result<TemplateStore>;
}

/// Does a template or workflow with this id and metadata pass the option filters?
pub fn accepts(options: &ScanOptions, id: &str, info: &Info) -> bool {
    let has_tag = |wanted: &String| info.tags.iter().any(|t| t.eq_ignore_ascii_case(wanted));

    if !options.template_ids.is_empty() && !options.template_ids.iter().any(|i| i == id) {
        return false;
    }
    if !options.tags.is_empty() && !options.tags.iter().any(has_tag) {
        return false;
    }
    if options.exclude_tags.iter().any(has_tag) {
        return false;
    }
    if !options.severities.is_empty() && !options.severities.contains(&info.severity) {
        return false;
    }
    true
}

/// Reads YAML documents from the catalog.
#[derive(Debug, Default, Clone, Copy)]
pub struct CatalogLoader;

impl CatalogLoader {
    fn parse_files(catalog: &dyn Catalog, paths: &[PathBuf]) -> Result<Vec<Document>> {
        let files = catalog.resolve(paths)?;
        let mut docs = Vec::with_capacity(files.len());
        for file in files {
            let source = match catalog.read(&file) {
                Ok(s) => s,
                Err(e) => {
                    warn!(path = %file.display(), error = %e, "skipping unreadable template");
                    continue;
                }
            };
            match Document::parse(&source) {
                Ok(doc) => docs.push(doc),
                Err(e) => {
                    warn!(path = %file.display(), error = %format!("{e:#}"), "skipping invalid template")
                }
            }
        }
        Ok(docs)
    }

    fn index(docs: &[Document]) -> HashMap<String, Arc<Template>> {
        docs.iter()
            .filter_map(|d| match d {
                Document::Template(t) => Some((t.id.clone(), Arc::new(t.clone()))),
                Document::Workflow { .. } => None,
            })
            .collect()
    }

    fn resolve_steps(
        workflow: &str,
        steps: &[WorkflowStep],
        index: &HashMap<String, Arc<Template>>,
    ) -> Vec<WorkflowNode> {
        steps
            .iter()
            .filter_map(|step| match index.get(&step.template) {
                Some(template) => Some(WorkflowNode {
                    template: Arc::clone(template),
                    subtemplates: Self::resolve_steps(workflow, &step.subtemplates, index),
                }),
                None => {
                    warn!(workflow, template = %step.template, "workflow references unknown template");
                    None
                }
            })
            .collect()
    }

    fn load_blocking(catalog: &dyn Catalog, options: &ScanOptions) -> Result<TemplateStore> {
        let docs = Self::parse_files(catalog, &options.templates)?;
        let mut index = Self::index(&docs);

        let needs_full_index = docs.iter().any(|d| match d {
            Document::Workflow { steps, .. } => steps.iter().any(|s| !index.contains_key(&s.template)),
            Document::Template(_) => false,
        });
        if needs_full_index && !options.templates.is_empty() {
            let all = Self::parse_files(catalog, &[])?;
            for (id, template) in Self::index(&all) {
                index.entry(id).or_insert(template);
            }
        }

        let mut templates = Vec::new();
        let mut workflows = Vec::new();
        for doc in &docs {
            if !accepts(options, doc.id(), doc.info()) {
                continue;
            }
            match doc {
                Document::Template(t) => {
                    if let Some(template) = index.get(&t.id) {
                        templates.push(Arc::clone(template));
                    }
                }
                Document::Workflow { id, info, steps } => {
                    let nodes = Self::resolve_steps(id, steps, &index);
                    if nodes.is_empty() {
                        warn!(workflow = %id, "workflow has no resolvable templates");
                        continue;
                    }
                    workflows.push(Arc::new(Workflow {
                        id: id.clone(),
                        info: info.clone(),
                        nodes,
                    }));
                }
            }
        }

        debug!(
            templates = templates.len(),
            workflows = workflows.len(),
            "loaded templates"
        );
        Ok(TemplateStore::new(templates, workflows))
    }
}

#[async_trait]
impl TemplateLoader for CatalogLoader {
    async fn load(&self, ctx: &ExecutionContext) -> Result<TemplateStore> {
        let catalog = Arc::clone(&ctx.catalog);
        let options = ctx.options.clone();
        tokio::task::spawn_blocking(move || Self::load_blocking(catalog.as_ref(), &options))
            .await
            .context("template loading task failed")?
    }
}

/// A fixed set of templates and workflows, filtered per invocation.
/// Counts how often it was asked to load.
#[derive(Debug, Default)]
pub struct StaticLoader {
    store: TemplateStore,
    calls: AtomicUsize,
}

impl StaticLoader {
    pub fn new(templates: Vec<Template>, workflows: Vec<Workflow>) -> Self {
        Self {
            store: TemplateStore::new(
                templates.into_iter().map(Arc::new).collect(),
                workflows.into_iter().map(Arc::new).collect(),
            ),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TemplateLoader for StaticLoader {
    async fn load(&self, ctx: &ExecutionContext) -> Result<TemplateStore> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let options = &ctx.options;
        let templates = self
            .store
            .templates()
            .iter()
            .filter(|t| accepts(options, &t.id, &t.info))
            .cloned()
            .collect();
        let workflows = self
            .store
            .workflows()
            .iter()
            .filter(|w| accepts(options, &w.id, &w.info))
            .cloned()
            .collect();
        Ok(TemplateStore::new(templates, workflows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{apply, with_exclude_tags, with_severities, with_tags, with_template_ids};
    use crate::template::Severity;

    fn info(severity: Severity, tags: &[&str]) -> Info {
        Info {
            name: "t".to_string(),
            severity,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            ..Info::default()
        }
    }

    fn opts(options: Vec<crate::options::ScanOption>) -> ScanOptions {
        let mut o = ScanOptions::default();
        apply(&mut o, options).unwrap();
        o
    }

    #[test]
    fn empty_filters_accept_everything() {
        assert!(accepts(&ScanOptions::default(), "a", &info(Severity::Info, &[])));
    }

    #[test]
    fn tag_filter_is_case_insensitive() {
        let o = opts(vec![with_tags(["CVE"])]);
        assert!(accepts(&o, "a", &info(Severity::High, &["cve", "rce"])));
        assert!(!accepts(&o, "a", &info(Severity::High, &["misc"])));
    }

    #[test]
    fn exclude_tags_win_over_tags() {
        let o = opts(vec![with_tags(["cve"]), with_exclude_tags(["dos"])]);
        assert!(!accepts(&o, "a", &info(Severity::High, &["cve", "dos"])));
    }

    #[test]
    fn severity_and_id_filters() {
        let o = opts(vec![with_severities(["high"]), with_template_ids(["a"])]);
        assert!(accepts(&o, "a", &info(Severity::High, &[])));
        assert!(!accepts(&o, "a", &info(Severity::Low, &[])));
        assert!(!accepts(&o, "b", &info(Severity::High, &[])));
    }

    #[test]
    fn store_emptiness_covers_both_sets() {
        assert!(TemplateStore::default().is_empty());
        let wf = Workflow {
            id: "w".to_string(),
            info: Info::default(),
            nodes: vec![],
        };
        assert!(!TemplateStore::new(vec![], vec![Arc::new(wf)]).is_empty());
    }
}
