//! Scan options and the option functions that mutate them.
//!
//! [`ScanOptions`] is a plain value. The engine keeps one copy as its base
//! and every invocation works on its own clone, so applying options to an
//! invocation can never leak into another one.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::consts::{DEFAULT_CONCURRENCY, DEFAULT_MAX_HOST_ERRORS, DEFAULT_TIMEOUT};
use crate::error::ConfigError;
use crate::template::Severity;

/// Everything an invocation can be tuned with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanOptions {
    /// Template files or directories, relative to the catalog root.
    /// Empty means the whole catalog.
    pub templates: Vec<PathBuf>,
    /// Only load templates with these ids.
    pub template_ids: Vec<String>,
    /// Only load templates carrying at least one of these tags.
    pub tags: Vec<String>,
    pub exclude_tags: Vec<String>,
    pub severities: Vec<Severity>,
    /// Work items in flight at once.
    pub concurrency: usize,
    /// Requests per second; 0 means no per-second quota.
    pub rate_limit: u32,
    /// Requests per minute; takes precedence over `rate_limit` when set.
    pub rate_limit_minute: u32,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub retries: u32,
    /// 0 disables host skipping.
    pub max_host_errors: u32,
    pub headers: BTreeMap<String, String>,
    pub no_color: bool,
    pub verbose: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            templates: Vec::new(),
            template_ids: Vec::new(),
            tags: Vec::new(),
            exclude_tags: Vec::new(),
            severities: Vec::new(),
            concurrency: DEFAULT_CONCURRENCY,
            rate_limit: 0,
            rate_limit_minute: 0,
            timeout: DEFAULT_TIMEOUT,
            retries: 0,
            max_host_errors: DEFAULT_MAX_HOST_ERRORS,
            headers: BTreeMap::new(),
            no_color: false,
            verbose: false,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// A function applied to a [`ScanOptions`] value, in order, at engine
/// construction or per invocation. The first error stops the chain.
pub type ScanOption = Box<dyn FnOnce(&mut ScanOptions) -> Result<(), ConfigError> + Send>;

/// Wrap a closure as a [`ScanOption`].
pub fn option<F>(f: F) -> ScanOption
where
    F: FnOnce(&mut ScanOptions) -> Result<(), ConfigError> + Send + 'static,
{
    Box::new(f)
}

/// Apply `options` in order. Mutations made before a failing function
/// remain on `target`; callers discard the value on error.
pub fn apply(
    target: &mut ScanOptions,
    options: impl IntoIterator<Item = ScanOption>,
) -> Result<(), ConfigError> {
    for f in options {
        f(target)?;
    }
    Ok(())
}

pub fn with_templates<I, P>(paths: I) -> ScanOption
where
    I: IntoIterator<Item = P>,
    P: Into<PathBuf>,
{
    let paths: Vec<PathBuf> = paths.into_iter().map(Into::into).collect();
    option(move |o| {
        o.templates.extend(paths);
        Ok(())
    })
}

pub fn with_template_ids<I, S>(ids: I) -> ScanOption
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let ids: Vec<String> = ids.into_iter().map(Into::into).collect();
    option(move |o| {
        o.template_ids.extend(ids);
        Ok(())
    })
}

pub fn with_tags<I, S>(tags: I) -> ScanOption
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let tags: Vec<String> = tags.into_iter().map(Into::into).collect();
    option(move |o| {
        o.tags.extend(tags);
        Ok(())
    })
}

pub fn with_exclude_tags<I, S>(tags: I) -> ScanOption
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let tags: Vec<String> = tags.into_iter().map(Into::into).collect();
    option(move |o| {
        o.exclude_tags.extend(tags);
        Ok(())
    })
}

/// Severities given as strings, e.g. from the command line.
pub fn with_severities<I, S>(severities: I) -> ScanOption
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let raw: Vec<String> = severities
        .into_iter()
        .map(|s| s.as_ref().to_string())
        .collect();
    option(move |o| {
        for s in raw {
            let severity = s
                .parse::<Severity>()
                .map_err(|e| ConfigError::new("severity", e))?;
            o.severities.push(severity);
        }
        Ok(())
    })
}

pub fn with_concurrency(concurrency: usize) -> ScanOption {
    option(move |o| {
        if concurrency == 0 {
            return Err(ConfigError::new("concurrency", "must be greater than zero"));
        }
        o.concurrency = concurrency;
        Ok(())
    })
}

/// Requests per second. 0 removes the quota.
pub fn with_rate_limit(per_second: u32) -> ScanOption {
    option(move |o| {
        o.rate_limit = per_second;
        Ok(())
    })
}

/// Requests per minute. 0 removes the quota.
pub fn with_rate_limit_minute(per_minute: u32) -> ScanOption {
    option(move |o| {
        o.rate_limit_minute = per_minute;
        Ok(())
    })
}

pub fn with_timeout(timeout: Duration) -> ScanOption {
    option(move |o| {
        if timeout.is_zero() {
            return Err(ConfigError::new("timeout", "must be greater than zero"));
        }
        o.timeout = timeout;
        Ok(())
    })
}

pub fn with_retries(retries: u32) -> ScanOption {
    option(move |o| {
        o.retries = retries;
        Ok(())
    })
}

pub fn with_max_host_errors(max: u32) -> ScanOption {
    option(move |o| {
        o.max_host_errors = max;
        Ok(())
    })
}

/// Extra headers in `Name: value` form, sent with every request.
pub fn with_headers<I, S>(headers: I) -> ScanOption
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let raw: Vec<String> = headers
        .into_iter()
        .map(|h| h.as_ref().to_string())
        .collect();
    option(move |o| {
        for header in raw {
            let (name, value) = header.split_once(':').ok_or_else(|| {
                ConfigError::new("header", format!("expected 'Name: value', got '{header}'"))
            })?;
            let name = name.trim();
            if name.is_empty() {
                return Err(ConfigError::new(
                    "header",
                    format!("empty header name in '{header}'"),
                ));
            }
            o.headers.insert(name.to_string(), value.trim().to_string());
        }
        Ok(())
    })
}

pub fn without_color() -> ScanOption {
    option(|o| {
        o.no_color = true;
        Ok(())
    })
}

pub fn with_verbose(verbose: bool) -> ScanOption {
    option(move |o| {
        o.verbose = verbose;
        Ok(())
    })
}
