//! Targets for one invocation.

/// An in-memory, finite set of targets scoped to a single invocation.
///
/// Targets are kept exactly as given: no trimming, no normalization and no
/// deduplication, so the same string set twice is scanned twice.
#[derive(Debug, Clone, Default)]
pub struct InputProvider {
    inputs: Vec<String>,
}

impl InputProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, target: impl Into<String>) {
        self.inputs.push(target.into());
    }

    pub fn count(&self) -> usize {
        self.inputs.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for InputProvider {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut provider = Self::new();
        for target in iter {
            provider.set(target);
        }
        provider
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_by_default() {
        assert_eq!(InputProvider::new().count(), 0);
    }

    #[test]
    fn keeps_duplicates_and_order() {
        let provider: InputProvider = ["https://a", "https://b", "https://a"].into_iter().collect();
        assert_eq!(provider.count(), 3);
        assert_eq!(
            provider.iter().collect::<Vec<_>>(),
            vec!["https://a", "https://b", "https://a"]
        );
    }

    #[test]
    fn does_not_normalize() {
        let mut provider = InputProvider::new();
        provider.set(" example.com ");
        provider.set("EXAMPLE.com");
        assert_eq!(provider.count(), 2);
        assert_eq!(provider.iter().next(), Some(" example.com "));
    }
}
