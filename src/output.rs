//! Result records and the writers that receive them.
//!
//! Matches and per-item failures both travel through an [`OutputWriter`].
//! Failures are information, not errors: a writer records them and the
//! scan moves on.

use std::io::Write;
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::template::Severity;

/// A template matched a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEvent {
    pub template_id: String,
    pub template_name: String,
    pub severity: Severity,
    /// The target as given to the invocation.
    pub host: String,
    /// The exact URL that produced the match.
    pub matched_at: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matcher_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
    pub timestamp_ms: u64,
}

/// A template × target evaluation that could not complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEvent {
    pub template_id: String,
    pub host: String,
    pub error: String,
    pub timestamp_ms: u64,
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Where records go. Shared by every invocation of an engine.
pub trait OutputWriter: Send + Sync {
    fn write(&self, event: &ResultEvent) -> Result<()>;
    fn write_failure(&self, event: &FailureEvent) -> Result<()>;

    /// Flush and release. Called once when the engine closes.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// ANSI coloring for terminal output.
#[derive(Debug, Clone, Copy)]
pub struct Colorizer {
    enabled: bool,
}

impl Colorizer {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    fn paint(&self, code: &str, text: &str) -> String {
        if self.enabled {
            format!("\x1b[{code}m{text}\x1b[0m")
        } else {
            text.to_string()
        }
    }

    pub fn severity(&self, severity: Severity) -> String {
        let code = match severity {
            Severity::Info => "34",
            Severity::Low => "32",
            Severity::Medium => "33",
            Severity::High => "31",
            Severity::Critical => "1;31",
            Severity::Unknown => "37",
        };
        self.paint(code, &severity.to_string())
    }

    pub fn bold(&self, text: &str) -> String {
        self.paint("1", text)
    }

    pub fn dim(&self, text: &str) -> String {
        self.paint("2", text)
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Line<'a> {
    Result(&'a ResultEvent),
    Failure(&'a FailureEvent),
}

/// One JSON object per line.
pub struct JsonLinesWriter<W: Write + Send> {
    out: Mutex<W>,
    include_failures: bool,
}

impl<W: Write + Send> JsonLinesWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
            include_failures: false,
        }
    }

    pub fn with_failures(mut self, include: bool) -> Self {
        self.include_failures = include;
        self
    }

    fn emit(&self, line: &Line<'_>) -> Result<()> {
        let json = serde_json::to_string(line)?;
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(out, "{json}").context("failed to write result")?;
        Ok(())
    }

    /// Recover the underlying writer.
    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write + Send> OutputWriter for JsonLinesWriter<W> {
    fn write(&self, event: &ResultEvent) -> Result<()> {
        self.emit(&Line::Result(event))
    }

    fn write_failure(&self, event: &FailureEvent) -> Result<()> {
        if self.include_failures {
            self.emit(&Line::Failure(event))?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.out
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
            .context("failed to flush results")
    }
}

/// Human-readable lines, e.g. `[git-config] [medium] https://x/.git/config [core]`.
pub struct ConsoleWriter {
    out: Mutex<Box<dyn Write + Send>>,
    colorizer: Colorizer,
}

impl ConsoleWriter {
    pub fn new(out: Box<dyn Write + Send>, colorizer: Colorizer) -> Self {
        Self {
            out: Mutex::new(out),
            colorizer,
        }
    }

    pub fn stdout(colorizer: Colorizer) -> Self {
        Self::new(Box::new(std::io::stdout()), colorizer)
    }

    pub fn format(&self, event: &ResultEvent) -> String {
        let c = &self.colorizer;
        let mut line = format!(
            "[{}] [{}] {}",
            c.bold(&event.template_id),
            c.severity(event.severity),
            event.matched_at
        );
        if !event.matcher_names.is_empty() {
            line.push_str(&format!(" [{}]", event.matcher_names.join(",")));
        }
        if let Some(workflow) = &event.workflow {
            line.push_str(&c.dim(&format!(" (workflow: {workflow})")));
        }
        line
    }
}

impl OutputWriter for ConsoleWriter {
    fn write(&self, event: &ResultEvent) -> Result<()> {
        let line = self.format(event);
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(out, "{line}").context("failed to write result")?;
        Ok(())
    }

    // Failures already go to the log; the console only shows findings.
    fn write_failure(&self, _event: &FailureEvent) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.out
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
            .context("failed to flush results")
    }
}

/// Keeps every record in memory. Useful when embedding the engine.
#[derive(Debug, Default)]
pub struct MemoryWriter {
    results: Mutex<Vec<ResultEvent>>,
    failures: Mutex<Vec<FailureEvent>>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> Vec<ResultEvent> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn failures(&self) -> Vec<FailureEvent> {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl OutputWriter for MemoryWriter {
    fn write(&self, event: &ResultEvent) -> Result<()> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }

    fn write_failure(&self, event: &FailureEvent) -> Result<()> {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }
}
