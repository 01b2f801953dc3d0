//! Tracks hosts that keep failing so scans stop hammering them.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use reqwest::Url;

/// Failure counts per host, shared by every invocation of an engine.
///
/// The cache only counts. Each invocation decides with its own
/// `max_host_errors` whether a host is blocked for it.
#[derive(Debug, Default)]
pub struct HostErrorCache {
    counts: Mutex<HashMap<String, u32>>,
}

impl HostErrorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The key a target is counted under: `host:port` for URLs, the raw
    /// string otherwise.
    pub fn host_key(target: &str) -> String {
        match Url::parse(target) {
            Ok(url) => match (url.host_str(), url.port_or_known_default()) {
                (Some(host), Some(port)) => format!("{host}:{port}"),
                (Some(host), None) => host.to_string(),
                _ => target.to_string(),
            },
            Err(_) => target.to_string(),
        }
    }

    /// Record one failure; returns the host's new count.
    pub fn mark_failed(&self, target: &str) -> u32 {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let count = counts.entry(Self::host_key(target)).or_insert(0);
        *count += 1;
        *count
    }

    pub fn errors(&self, target: &str) -> u32 {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&Self::host_key(target))
            .copied()
            .unwrap_or(0)
    }

    /// Whether `target` reached `max_errors` failures. `max_errors == 0`
    /// never blocks a host.
    pub fn is_blocked(&self, target: &str, max_errors: u32) -> bool {
        max_errors != 0 && self.errors(target) >= max_errors
    }

    pub fn clear(&self) {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_key_normalizes_urls() {
        assert_eq!(
            HostErrorCache::host_key("https://example.com/a/b"),
            "example.com:443"
        );
        assert_eq!(
            HostErrorCache::host_key("http://example.com:8080"),
            "example.com:8080"
        );
        assert_eq!(HostErrorCache::host_key("not a url"), "not a url");
    }

    #[test]
    fn blocks_after_max_errors() {
        let cache = HostErrorCache::new();
        assert!(!cache.is_blocked("https://example.com", 2));
        cache.mark_failed("https://example.com/x");
        assert!(!cache.is_blocked("https://example.com", 2));
        cache.mark_failed("https://example.com/y");
        assert!(cache.is_blocked("https://example.com/anything", 2));
        assert!(!cache.is_blocked("https://other.com", 2));
    }

    #[test]
    fn threshold_is_chosen_by_the_caller() {
        let cache = HostErrorCache::new();
        cache.mark_failed("https://example.com");
        assert!(cache.is_blocked("https://example.com", 1));
        assert!(!cache.is_blocked("https://example.com", 30));
        assert_eq!(cache.errors("https://example.com:443"), 1);
    }

    #[test]
    fn zero_max_never_blocks() {
        let cache = HostErrorCache::new();
        for _ in 0..10 {
            cache.mark_failed("https://example.com");
        }
        assert!(!cache.is_blocked("https://example.com", 0));
    }

    #[test]
    fn clear_forgets_hosts() {
        let cache = HostErrorCache::new();
        cache.mark_failed("https://example.com");
        cache.clear();
        assert!(!cache.is_blocked("https://example.com", 1));
    }
}
