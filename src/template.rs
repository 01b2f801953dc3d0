//! Template and workflow definitions as they appear in YAML files.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// How bad a finding is.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
    #[default]
    Unknown,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" => Ok(Self::Info),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// Descriptive metadata shared by templates and workflows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Which part of a response a matcher looks at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Part {
    #[default]
    Body,
    Header,
    All,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    #[default]
    Or,
    And,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MatcherKind {
    Word {
        words: Vec<String>,
        #[serde(default)]
        condition: Condition,
        #[serde(default)]
        part: Part,
    },
    Status {
        status: Vec<u16>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matcher {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub negative: bool,
    #[serde(flatten)]
    pub kind: MatcherKind,
}

/// The slice of a response the matchers need.
#[derive(Debug, Clone, Default)]
pub struct ResponseView {
    pub status: u16,
    pub headers: String,
    pub body: String,
}

impl Matcher {
    pub fn matches(&self, response: &ResponseView) -> bool {
        let hit = match &self.kind {
            MatcherKind::Status { status } => status.contains(&response.status),
            MatcherKind::Word {
                words,
                condition,
                part,
            } => {
                let haystack = match part {
                    Part::Body => response.body.clone(),
                    Part::Header => response.headers.clone(),
                    Part::All => format!("{}\n{}", response.headers, response.body),
                };
                match condition {
                    Condition::Or => words.iter().any(|w| haystack.contains(w.as_str())),
                    Condition::And => words.iter().all(|w| haystack.contains(w.as_str())),
                }
            }
        };
        hit != self.negative
    }
}

/// One HTTP request block of a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    #[serde(default = "default_method")]
    pub method: String,
    pub path: Vec<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default, rename = "matchers-condition")]
    pub matchers_condition: Condition,
    #[serde(default)]
    pub matchers: Vec<Matcher>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl HttpRequest {
    /// Evaluate all matchers. Returns the names of the matchers that fired,
    /// or `None` when the request as a whole did not match.
    pub fn evaluate(&self, response: &ResponseView) -> Option<Vec<String>> {
        if self.matchers.is_empty() {
            return None;
        }
        let mut fired = Vec::new();
        let mut all = true;
        for matcher in &self.matchers {
            if matcher.matches(response) {
                if let Some(name) = &matcher.name {
                    fired.push(name.clone());
                }
                if self.matchers_condition == Condition::Or {
                    return Some(fired);
                }
            } else {
                all = false;
            }
        }
        match self.matchers_condition {
            Condition::And if all => Some(fired),
            _ => None,
        }
    }

    /// Key identifying requests that would put identical bytes on the wire.
    pub fn signature(&self) -> String {
        let mut headers: Vec<_> = self.headers.iter().collect();
        headers.sort();
        format!(
            "{} {:?} {:?} {:?}",
            self.method.to_ascii_uppercase(),
            self.path,
            headers,
            self.body
        )
    }
}

/// A single check: metadata plus the requests that implement it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub info: Info,
    #[serde(default)]
    pub http: Vec<HttpRequest>,
}

/// A reference to a template inside a workflow file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub template: String,
    #[serde(default)]
    pub subtemplates: Vec<WorkflowStep>,
}

/// A resolved workflow node: the template plus the nodes that run only when it matched.
#[derive(Debug, Clone)]
pub struct WorkflowNode {
    pub template: Arc<Template>,
    pub subtemplates: Vec<WorkflowNode>,
}

/// A workflow whose template references were resolved by the loader.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub id: String,
    pub info: Info,
    pub nodes: Vec<WorkflowNode>,
}

/// What a YAML file on disk turned out to be.
#[derive(Debug, Clone)]
pub enum Document {
    Template(Template),
    Workflow {
        id: String,
        info: Info,
        steps: Vec<WorkflowStep>,
    },
}

#[derive(Deserialize)]
struct RawDocument {
    id: String,
    info: Info,
    #[serde(default)]
    http: Vec<HttpRequest>,
    #[serde(default)]
    workflows: Vec<WorkflowStep>,
}

impl Document {
    pub fn id(&self) -> &str {
        match self {
            Self::Template(t) => &t.id,
            Self::Workflow { id, .. } => id,
        }
    }

    pub fn info(&self) -> &Info {
        match self {
            Self::Template(t) => &t.info,
            Self::Workflow { info, .. } => info,
        }
    }

    /// Parse one YAML document.
    pub fn parse(source: &str) -> Result<Self> {
        let raw: RawDocument = serde_yaml::from_str(source).context("invalid template yaml")?;
        if raw.id.trim().is_empty() {
            bail!("template id is empty");
        }
        match (raw.http.is_empty(), raw.workflows.is_empty()) {
            (false, true) => Ok(Self::Template(Template {
                id: raw.id,
                info: raw.info,
                http: raw.http,
            })),
            (true, false) => Ok(Self::Workflow {
                id: raw.id,
                info: raw.info,
                steps: raw.workflows,
            }),
            (false, false) => bail!("{}: both http requests and workflows defined", raw.id),
            (true, true) => bail!("{}: no http requests or workflows defined", raw.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIT_CONFIG: &str = r#"
id: git-config
info:
  name: Git Config
  severity: medium
  tags: [exposure, git]
http:
  - method: GET
    path: ["{{BaseURL}}/.git/config"]
    matchers-condition: and
    matchers:
      - type: word
        words: ["[core]"]
      - type: status
        status: [200]
"#;

    fn response(status: u16, body: &str) -> ResponseView {
        ResponseView {
            status,
            headers: "content-type: text/plain".to_string(),
            body: body.to_string(),
        }
    }

    #[test]
    fn parses_template() {
        let doc = Document::parse(GIT_CONFIG).unwrap();
        let Document::Template(t) = doc else {
            panic!("expected template");
        };
        assert_eq!(t.id, "git-config");
        assert_eq!(t.info.severity, Severity::Medium);
        assert_eq!(t.info.tags, vec!["exposure", "git"]);
        assert_eq!(t.http[0].method, "GET");
        assert_eq!(t.http[0].matchers_condition, Condition::And);
        assert_eq!(t.http[0].matchers.len(), 2);
    }

    #[test]
    fn parses_workflow() {
        let doc = Document::parse(
            r#"
id: wp-workflow
info:
  name: WordPress
workflows:
  - template: wp-detect
    subtemplates:
      - template: wp-users
"#,
        )
        .unwrap();
        let Document::Workflow { steps, info, .. } = doc else {
            panic!("expected workflow");
        };
        assert_eq!(info.severity, Severity::Unknown);
        assert_eq!(steps[0].template, "wp-detect");
        assert_eq!(steps[0].subtemplates[0].template, "wp-users");
    }

    #[test]
    fn rejects_document_without_body() {
        let err = Document::parse("id: empty\ninfo:\n  name: Empty\n").unwrap_err();
        assert!(err.to_string().contains("no http requests or workflows"));
    }

    #[test]
    fn and_condition_requires_every_matcher() {
        let Document::Template(t) = Document::parse(GIT_CONFIG).unwrap() else {
            unreachable!()
        };
        let req = &t.http[0];
        assert!(req.evaluate(&response(200, "[core]\nbare = false")).is_some());
        assert!(req.evaluate(&response(404, "[core]")).is_none());
        assert!(req.evaluate(&response(200, "nothing here")).is_none());
    }

    #[test]
    fn or_condition_reports_first_named_matcher() {
        let req = HttpRequest {
            method: "GET".to_string(),
            path: vec!["{{BaseURL}}/".to_string()],
            headers: HashMap::new(),
            body: None,
            matchers_condition: Condition::Or,
            matchers: vec![
                Matcher {
                    name: Some("nginx".to_string()),
                    negative: false,
                    kind: MatcherKind::Word {
                        words: vec!["nginx".to_string()],
                        condition: Condition::Or,
                        part: Part::All,
                    },
                },
                Matcher {
                    name: Some("ok".to_string()),
                    negative: false,
                    kind: MatcherKind::Status { status: vec![200] },
                },
            ],
        };
        let fired = req.evaluate(&response(500, "served by nginx")).unwrap();
        assert_eq!(fired, vec!["nginx"]);
    }

    #[test]
    fn negative_matcher_inverts() {
        let m = Matcher {
            name: None,
            negative: true,
            kind: MatcherKind::Status { status: vec![404] },
        };
        assert!(m.matches(&response(200, "")));
        assert!(!m.matches(&response(404, "")));
    }

    #[test]
    fn severity_round_trips_through_str() {
        assert_eq!("HIGH".parse::<Severity>().unwrap(), Severity::High);
        assert_eq!(Severity::Critical.to_string(), "critical");
        assert!("urgent".parse::<Severity>().is_err());
    }

    #[test]
    fn signature_ignores_header_order() {
        let mut a = HttpRequest {
            method: "get".to_string(),
            path: vec!["{{BaseURL}}/x".to_string()],
            headers: HashMap::new(),
            body: None,
            matchers_condition: Condition::Or,
            matchers: vec![],
        };
        a.headers.insert("A".to_string(), "1".to_string());
        a.headers.insert("B".to_string(), "2".to_string());
        let mut b = a.clone();
        b.method = "GET".to_string();
        assert_eq!(a.signature(), b.signature());
    }
}
