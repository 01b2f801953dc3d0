//! Project-wide constants.

use std::path::PathBuf;
use std::time::Duration;

pub const AUTHOR: &str = env!("CARGO_PKG_AUTHORS");
pub const HOMEPAGE: &str = env!("CARGO_PKG_HOMEPAGE");
pub const REPO: &str = env!("CARGO_PKG_REPOSITORY");

/// Work items allowed in flight per invocation when none is specified.
pub const DEFAULT_CONCURRENCY: usize = 25;

/// Per-request timeout when none is specified.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Failures after which an invocation skips a host. Counts are shared by
/// every invocation of an engine.
pub const DEFAULT_MAX_HOST_ERRORS: u32 = 30;

/// Finished scans whose final progress a `ScanService` still reports.
pub const FINISHED_SCANS_KEPT: usize = 256;

/// Environment variable holding the log filter directives.
pub const LOG_ENV: &str = "SCANHIVE_LOG";

/// Placeholder replaced with the target inside request paths.
pub const BASE_URL_PLACEHOLDER: &str = "{{BaseURL}}";

/// Placeholder replaced with an out-of-band callback URL, when available.
pub const INTERACTION_PLACEHOLDER: &str = "{{interaction_url}}";

/// Default database path: `~/.scanhive/scanhive.db`.
pub fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".scanhive")
        .join("scanhive.db")
}

/// Default template directory: `~/.scanhive/templates`.
pub fn default_templates_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".scanhive")
        .join("templates")
}

/// Format a number with comma separators (e.g. 1,234,567).
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i).is_multiple_of(3) {
            result.push(',');
        }
        result.push(c);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consts_are_non_empty() {
        assert!(!AUTHOR.is_empty());
        assert!(!HOMEPAGE.is_empty());
        assert!(!REPO.is_empty());
    }

    #[test]
    fn defaults_are_usable() {
        assert!(DEFAULT_CONCURRENCY > 0);
        assert!(!DEFAULT_TIMEOUT.is_zero());
    }

    #[test]
    fn default_db_path_ends_with_db_file() {
        let path = default_db_path();
        assert!(path.ends_with(".scanhive/scanhive.db"));
    }

    #[test]
    fn format_number_small() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
    }

    #[test]
    fn format_number_thousands() {
        assert_eq!(format_number(1_000), "1,000");
        assert_eq!(format_number(123_456), "123,456");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
