use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};

use super::{NewScan, ScanRecord, ScanRegistry, ScanStatus};

const COLUMNS: &str = "id, status, name, templates, targets, config, run_now, reporting,
    schedule_occurrence, schedule_time, source, scan_time_ms, hosts";

/// SQLite-backed scan registry.
pub struct SqliteRegistry {
    conn: Mutex<Connection>,
}

/// Columns as stored; list columns hold JSON arrays.
struct RawRow {
    id: i64,
    status: String,
    name: String,
    templates: String,
    targets: String,
    config: String,
    run_now: bool,
    reporting: String,
    schedule_occurrence: String,
    schedule_time: String,
    source: String,
    scan_time_ms: i64,
    hosts: i64,
}

impl RawRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            status: row.get(1)?,
            name: row.get(2)?,
            templates: row.get(3)?,
            targets: row.get(4)?,
            config: row.get(5)?,
            run_now: row.get(6)?,
            reporting: row.get(7)?,
            schedule_occurrence: row.get(8)?,
            schedule_time: row.get(9)?,
            source: row.get(10)?,
            scan_time_ms: row.get(11)?,
            hosts: row.get(12)?,
        })
    }

    fn into_record(self) -> Result<ScanRecord> {
        Ok(ScanRecord {
            id: self.id,
            status: self.status.parse()?,
            scan: NewScan {
                name: self.name,
                templates: serde_json::from_str(&self.templates)
                    .context("corrupt templates column")?,
                targets: serde_json::from_str(&self.targets).context("corrupt targets column")?,
                config: self.config,
                run_now: self.run_now,
                reporting: self.reporting,
                schedule_occurrence: self.schedule_occurrence,
                schedule_time: self.schedule_time,
                source: self.source,
            },
            scan_time_ms: self.scan_time_ms.max(0) as u64,
            hosts: self.hosts.max(0) as u64,
        })
    }
}

impl SqliteRegistry {
    /// Open or create the registry. Parent directories are created.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        Self::open(Connection::open(path).context("failed to open scan database")?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(Connection::open_in_memory().context("failed to open scan database")?)
    }

    fn open(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS scans (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created TEXT NOT NULL DEFAULT (datetime('now')),
                status TEXT NOT NULL,
                name TEXT NOT NULL,
                templates TEXT NOT NULL,
                targets TEXT NOT NULL,
                config TEXT NOT NULL,
                run_now INTEGER NOT NULL,
                reporting TEXT NOT NULL,
                schedule_occurrence TEXT NOT NULL,
                schedule_time TEXT NOT NULL,
                source TEXT NOT NULL,
                scan_time_ms INTEGER NOT NULL DEFAULT 0,
                hosts INTEGER NOT NULL
            )",
        )
        .context("failed to create scans table")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ScanRegistry for SqliteRegistry {
    async fn add_scan(&self, scan: NewScan) -> Result<i64> {
        let config = if scan.config.is_empty() {
            "default".to_string()
        } else {
            scan.config
        };
        let templates = serde_json::to_string(&scan.templates)?;
        let targets = serde_json::to_string(&scan.targets)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO scans (status, name, templates, targets, config, run_now, reporting,
                schedule_occurrence, schedule_time, source, hosts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                ScanStatus::Scheduled.as_str(),
                scan.name,
                templates,
                targets,
                config,
                scan.run_now,
                scan.reporting,
                scan.schedule_occurrence,
                scan.schedule_time,
                scan.source,
                scan.targets.len() as i64,
            ],
        )
        .context("failed to insert scan")?;
        Ok(conn.last_insert_rowid())
    }

    async fn scans(&self, search: Option<&str>) -> Result<Vec<ScanRecord>> {
        let conn = self.conn();
        let pattern = format!("%{}%", escape_like(search.unwrap_or("")));
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM scans WHERE name LIKE ?1 ESCAPE '\\' ORDER BY id ASC"
        ))?;
        let rows = stmt
            .query_map([&pattern], RawRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawRow::into_record).collect()
    }

    async fn scan(&self, id: i64) -> Result<Option<ScanRecord>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM scans WHERE id = ?1"),
                [id],
                RawRow::read,
            )
            .optional()?;
        row.map(RawRow::into_record).transpose()
    }

    async fn set_status(&self, id: i64, status: ScanStatus) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE scans SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        if changed == 0 {
            bail!("scan {id} not found");
        }
        Ok(())
    }

    async fn finish(&self, id: i64, status: ScanStatus, scan_time: Duration) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE scans SET status = ?1, scan_time_ms = ?2 WHERE id = ?3",
            params![status.as_str(), scan_time.as_millis() as i64, id],
        )?;
        if changed == 0 {
            bail!("scan {id} not found");
        }
        Ok(())
    }
}

/// Make `%`, `_` and `\` match literally in a `LIKE ... ESCAPE '\'` pattern.
fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(name: &str, targets: &[&str]) -> NewScan {
        NewScan {
            name: name.to_string(),
            templates: vec!["tech-detect".to_string()],
            targets: targets.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn add_fills_defaults() {
        let registry = SqliteRegistry::in_memory().unwrap();
        let id = registry
            .add_scan(scan("weekly", &["a.example", "b.example"]))
            .await
            .unwrap();
        let record = registry.scan(id).await.unwrap().unwrap();
        assert_eq!(record.status, ScanStatus::Scheduled);
        assert_eq!(record.scan.config, "default");
        assert_eq!(record.hosts, 2);
        assert_eq!(record.scan.templates, vec!["tech-detect"]);
    }

    #[tokio::test]
    async fn missing_scan_is_none() {
        let registry = SqliteRegistry::in_memory().unwrap();
        assert!(registry.scan(42).await.unwrap().is_none());
        assert!(registry.set_status(42, ScanStatus::Running).await.is_err());
    }

    #[tokio::test]
    async fn finish_records_time() {
        let registry = SqliteRegistry::in_memory().unwrap();
        let id = registry.add_scan(scan("once", &["x"])).await.unwrap();
        registry.set_status(id, ScanStatus::Running).await.unwrap();
        registry
            .finish(id, ScanStatus::Done, Duration::from_millis(1234))
            .await
            .unwrap();
        let record = registry.scan(id).await.unwrap().unwrap();
        assert_eq!(record.status, ScanStatus::Done);
        assert_eq!(record.scan_time_ms, 1234);
    }

    #[test]
    fn like_wildcards_are_escaped() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
        assert_eq!(escape_like("weekly"), "weekly");
    }

    #[tokio::test]
    async fn search_treats_wildcards_literally() {
        let registry = SqliteRegistry::in_memory().unwrap();
        for name in ["50% sample", "500 hosts", "a_b", "axb"] {
            registry.add_scan(scan(name, &["x"])).await.unwrap();
        }
        let names = |records: Vec<ScanRecord>| {
            records
                .into_iter()
                .map(|r| r.scan.name)
                .collect::<Vec<_>>()
        };
        assert_eq!(
            names(registry.scans(Some("50%")).await.unwrap()),
            vec!["50% sample"]
        );
        assert_eq!(names(registry.scans(Some("a_b")).await.unwrap()), vec!["a_b"]);
    }
}
