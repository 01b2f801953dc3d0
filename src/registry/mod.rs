//! Persistent records of named scans.

pub mod sqlite;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Lifecycle of a registered scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Scheduled,
    Running,
    Done,
    Failed,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ScanStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "scheduled" => Self::Scheduled,
            "running" => Self::Running,
            "done" => Self::Done,
            "failed" => Self::Failed,
            other => bail!("unknown scan status: {other}"),
        })
    }
}

/// A scan as submitted, before the registry assigns an id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NewScan {
    pub name: String,
    pub templates: Vec<String>,
    pub targets: Vec<String>,
    /// Named engine configuration; empty means `"default"`.
    pub config: String,
    pub run_now: bool,
    pub reporting: String,
    pub schedule_occurrence: String,
    pub schedule_time: String,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ScanRecord {
    pub id: i64,
    pub status: ScanStatus,
    #[serde(flatten)]
    pub scan: NewScan,
    pub scan_time_ms: u64,
    /// Number of targets the scan covers.
    pub hosts: u64,
}

impl ScanRecord {
    pub fn scan_time(&self) -> Duration {
        Duration::from_millis(self.scan_time_ms)
    }
}

/// Where scan records live. Could be SQLite, an HTTP API, etc.
#[async_trait]
pub trait ScanRegistry: Send + Sync {
    /// Store a new scan as `scheduled` and return its id.
    async fn add_scan(&self, scan: NewScan) -> Result<i64>;
    /// All scans, optionally only those whose name contains `search`.
    async fn scans(&self, search: Option<&str>) -> Result<Vec<ScanRecord>>;
    async fn scan(&self, id: i64) -> Result<Option<ScanRecord>>;
    async fn set_status(&self, id: i64, status: ScanStatus) -> Result<()>;
    /// Record the final status and how long the scan ran.
    async fn finish(&self, id: i64, status: ScanStatus, scan_time: Duration) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            ScanStatus::Scheduled,
            ScanStatus::Running,
            ScanStatus::Done,
            ScanStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<ScanStatus>().unwrap(), status);
        }
        assert!("paused".parse::<ScanStatus>().is_err());
    }

    #[test]
    fn record_serializes_flat() {
        let record = ScanRecord {
            id: 3,
            status: ScanStatus::Done,
            scan: NewScan {
                name: "nightly".to_string(),
                run_now: true,
                ..Default::default()
            },
            scan_time_ms: 1500,
            hosts: 2,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["name"], "nightly");
        assert_eq!(json["run-now"], true);
        assert_eq!(json["status"], "done");
        assert_eq!(record.scan_time(), Duration::from_millis(1500));
    }
}
