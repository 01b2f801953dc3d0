use std::fs;
use std::path::Path;
use std::sync::Arc;

use scanhive::catalog::DirCatalog;
use scanhive::engine::{EngineBuilder, ThreadSafeEngine};
use scanhive::error::ScanError;
use scanhive::executor::mock::MockExecutorFactory;
use scanhive::options::{with_exclude_tags, with_severities, with_tags, with_templates};
use scanhive::output::MemoryWriter;

const GIT_CONFIG: &str = r#"
id: git-config
info:
  name: Exposed git config
  author: hive
  severity: medium
  tags: [exposure, git]
http:
  - method: GET
    path:
      - "{{BaseURL}}/.git/config"
    matchers:
      - type: word
        name: core
        words: ["[core]"]
"#;

const GIT_HEAD: &str = r#"
id: git-head
info:
  name: Exposed git HEAD
  severity: low
  tags: [exposure, git]
http:
  - path:
      - "{{BaseURL}}/.git/HEAD"
    matchers-condition: and
    matchers:
      - type: status
        status: [200]
      - type: word
        part: body
        words: ["ref: refs/"]
"#;

const PANEL: &str = r#"
id: admin-panel
info:
  name: Admin panel
  severity: info
  tags: [panel]
http:
  - path:
      - "{{BaseURL}}/admin"
    matchers:
      - type: word
        words: ["Admin"]
"#;

const WORKFLOW: &str = r#"
id: git-workflow
info:
  name: Git exposure chain
  tags: [git]
workflows:
  - template: git-config
    subtemplates:
      - template: git-head
"#;

fn write(root: &Path, rel: &str, body: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, body).unwrap();
}

fn catalog() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "exposures/git-config.yaml", GIT_CONFIG);
    write(dir.path(), "exposures/git-head.yml", GIT_HEAD);
    write(dir.path(), "panels/admin.yaml", PANEL);
    write(dir.path(), "workflows/git.yaml", WORKFLOW);
    write(dir.path(), "broken/oops.yaml", "id: [unterminated");
    write(dir.path(), "notes/readme.txt", "not a template");
    dir
}

fn engine(root: &Path) -> (ThreadSafeEngine, Arc<MockExecutorFactory>) {
    let executors = Arc::new(MockExecutorFactory::new());
    let engine = EngineBuilder::new(vec![])
        .unwrap()
        .catalog(Arc::new(DirCatalog::new(root)))
        .executors(executors.clone())
        .output(Arc::new(MemoryWriter::new()))
        .build();
    (engine, executors)
}

#[tokio::test]
async fn whole_catalog_loads_and_skips_broken_files() {
    let dir = catalog();
    let (engine, executors) = engine(dir.path());

    engine.execute(&["https://a.example"], vec![]).await.unwrap();

    let seen = &executors.observations()[0];
    let mut templates = seen.templates.clone();
    templates.sort();
    assert_eq!(templates, vec!["admin-panel", "git-config", "git-head"]);
    assert_eq!(seen.workflows, vec!["git-workflow"]);
}

#[tokio::test]
async fn filters_apply_per_invocation() {
    let dir = catalog();
    let (engine, executors) = engine(dir.path());

    engine
        .execute(&["https://a.example"], vec![with_tags(["PANEL"])])
        .await
        .unwrap();
    engine
        .execute(
            &["https://a.example"],
            vec![with_tags(["git"]), with_severities(["low"])],
        )
        .await
        .unwrap();
    engine
        .execute(&["https://a.example"], vec![with_exclude_tags(["git"])])
        .await
        .unwrap();

    let observations = executors.observations();
    assert_eq!(observations[0].templates, vec!["admin-panel"]);
    assert!(observations[0].workflows.is_empty());
    assert_eq!(observations[1].templates, vec!["git-head"]);
    assert!(observations[1].workflows.is_empty());
    assert_eq!(observations[2].templates, vec!["admin-panel"]);
}

#[tokio::test]
async fn workflow_file_alone_resolves_its_templates() {
    let dir = catalog();
    let (engine, executors) = engine(dir.path());

    engine
        .execute(
            &["https://a.example"],
            vec![with_templates(["workflows/git.yaml"])],
        )
        .await
        .unwrap();

    let seen = &executors.observations()[0];
    assert!(seen.templates.is_empty());
    assert_eq!(seen.workflows, vec!["git-workflow"]);
}

#[tokio::test]
async fn missing_template_path_is_a_loader_error() {
    let dir = catalog();
    let (engine, executors) = engine(dir.path());

    let err = engine
        .execute(&["https://a.example"], vec![with_templates(["nope/"])])
        .await
        .unwrap_err();

    assert!(matches!(err, ScanError::Loader(_)));
    assert!(err.to_string().starts_with("could not create loader client"));
    assert_eq!(executors.created(), 0);
}

#[tokio::test]
async fn empty_catalog_reports_no_templates() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _) = engine(dir.path());

    let err = engine
        .execute(&["https://a.example"], vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::NoTemplatesAvailable));
}
