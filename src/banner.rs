//! Startup banner and scan summary display.

use std::path::Path;
use std::time::Duration;

use crate::consts::{AUTHOR, HOMEPAGE, REPO, format_number};
use crate::progress::ProgressSnapshot;

/// Scan configuration for display in the startup banner.
pub struct BannerInfo<'a> {
    pub templates_dir: &'a Path,
    pub targets: usize,
    pub concurrency: usize,
    pub rate_limit: &'a str,
    pub output: &'a str,
}

/// Print the startup banner with scan info. Goes to stderr so stdout only
/// carries results.
pub fn print_banner(info: &BannerInfo) {
    eprintln!(
        r#"
   ╔═══════════════════════════════════════╗
   ║           S C A N H I V E             ║
   ║     many scans, one engine, no mix    ║
   ╚═══════════════════════════════════════╝

   version     {}
   by          {}
   home        {}
   repo        {}
   templates   {}
   targets     {}
   concurrency {}
   rate limit  {}
   output      {}
"#,
        env!("CARGO_PKG_VERSION"),
        AUTHOR,
        HOMEPAGE,
        REPO,
        info.templates_dir.display(),
        info.targets,
        info.concurrency,
        info.rate_limit,
        info.output,
    );
}

/// One-line summary of a finished scan.
pub fn summary_line(progress: ProgressSnapshot, elapsed: Duration) -> String {
    format!(
        "scan: {} requests, {} matched, {} failed in {:.1}s",
        format_number(progress.requests_done),
        format_number(progress.matched),
        format_number(progress.errors),
        elapsed.as_secs_f64(),
    )
}

pub fn print_scan_summary(progress: ProgressSnapshot, elapsed: Duration) {
    eprintln!("{}", summary_line(progress, elapsed));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn print_banner_does_not_panic() {
        let info = BannerInfo {
            templates_dir: &PathBuf::from("/tmp/templates"),
            targets: 3,
            concurrency: 25,
            rate_limit: "unlimited",
            output: "console",
        };
        print_banner(&info);
    }

    #[test]
    fn summary_formats_counts() {
        let progress = ProgressSnapshot {
            requests_total: 1500,
            requests_done: 1234,
            matched: 5,
            errors: 2,
        };
        let line = summary_line(progress, Duration::from_millis(2500));
        assert_eq!(line, "scan: 1,234 requests, 5 matched, 2 failed in 2.5s");
    }
}
