//! Errors surfaced by the engine facade.
//!
//! Setup failures (bad options, nothing to load, nothing to scan) abort an
//! invocation before any request is sent and are returned to the caller.
//! Failures of individual template × target evaluations are never errors
//! here; they travel through the output channel as
//! [`FailureEvent`](crate::output::FailureEvent) records.

use thiserror::Error;

/// An option function rejected its input.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid option {option}: {reason}")]
pub struct ConfigError {
    pub option: &'static str,
    pub reason: String,
}

impl ConfigError {
    pub fn new(option: &'static str, reason: impl Into<String>) -> Self {
        Self {
            option,
            reason: reason.into(),
        }
    }
}

/// Why an invocation never started scanning.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no templates available")]
    NoTemplatesAvailable,

    #[error("no targets available")]
    NoTargetsAvailable,

    #[error("could not create loader client: {0:#}")]
    Loader(anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn config_error_names_option() {
        let err = ConfigError::new("concurrency", "must be greater than zero");
        assert_eq!(
            err.to_string(),
            "invalid option concurrency: must be greater than zero"
        );
    }

    #[test]
    fn config_error_converts_into_scan_error() {
        let err: ScanError = ConfigError::new("timeout", "zero").into();
        assert!(matches!(err, ScanError::Config(_)));
        assert_eq!(err.to_string(), "invalid option timeout: zero");
    }

    #[test]
    fn loader_error_keeps_context_chain() {
        let inner = anyhow!("permission denied").context("reading templates/");
        let err = ScanError::Loader(inner);
        let msg = err.to_string();
        assert!(msg.starts_with("could not create loader client"));
        assert!(msg.contains("reading templates/"));
        assert!(msg.contains("permission denied"));
    }
}
