//! Out-of-band interaction URLs.

/// Supplies callback URLs that templates embed in requests to detect blind
/// interactions. Shared by every invocation.
pub trait InteractionClient: Send + Sync {
    /// A URL unique to `correlation`, or `None` when no server is configured.
    fn url(&self, correlation: &str) -> Option<String>;

    fn close(&self) {}
}

/// No interaction server: placeholders are left untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInteractions;

impl InteractionClient for NoopInteractions {
    fn url(&self, _correlation: &str) -> Option<String> {
        None
    }
}

/// A self-hosted collector reachable at `base`; each correlation id becomes
/// a path segment.
#[derive(Debug, Clone)]
pub struct StaticInteractions {
    base: String,
}

impl StaticInteractions {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
        }
    }
}

impl InteractionClient for StaticInteractions {
    fn url(&self, correlation: &str) -> Option<String> {
        Some(format!("{}/{}", self.base, correlation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_has_no_url() {
        assert!(NoopInteractions.url("abc").is_none());
    }

    #[test]
    fn static_joins_correlation() {
        let client = StaticInteractions::new("https://oob.example.com/");
        assert_eq!(
            client.url("abc").as_deref(),
            Some("https://oob.example.com/abc")
        );
    }
}
