//! Runs registered scans on one shared engine.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::consts::FINISHED_SCANS_KEPT;
use crate::engine::{InvocationHooks, ThreadSafeEngine};
use crate::options::{ScanOption, with_template_ids, with_templates};
use crate::progress::{Progress, ProgressSnapshot, ProgressTracker};
use crate::registry::{NewScan, ScanRecord, ScanRegistry, ScanStatus};

/// Registry entries name templates either by id or by path. Entries that
/// look like a path (a separator or a YAML extension) are paths.
pub fn template_options(templates: &[String]) -> Vec<ScanOption> {
    let (paths, ids): (Vec<&String>, Vec<&String>) = templates.iter().partition(|t| {
        t.contains('/') || t.contains('\\') || t.ends_with(".yaml") || t.ends_with(".yml")
    });
    let mut options = Vec::new();
    if !paths.is_empty() {
        options.push(with_templates(paths.into_iter().map(PathBuf::from)));
    }
    if !ids.is_empty() {
        options.push(with_template_ids(ids.into_iter().cloned()));
    }
    options
}

/// Live trackers of running scans, plus the final counters of the most
/// recently finished ones.
#[derive(Debug)]
struct ProgressBook {
    live: HashMap<i64, Arc<ProgressTracker>>,
    finished: VecDeque<(i64, ProgressSnapshot)>,
    keep: usize,
}

impl ProgressBook {
    fn new(keep: usize) -> Self {
        Self {
            live: HashMap::new(),
            finished: VecDeque::new(),
            keep,
        }
    }

    fn start(&mut self, id: i64, tracker: Arc<ProgressTracker>) {
        self.finished.retain(|(done, _)| *done != id);
        self.live.insert(id, tracker);
    }

    fn finish(&mut self, id: i64) {
        let Some(tracker) = self.live.remove(&id) else {
            return;
        };
        if self.keep == 0 {
            return;
        }
        self.finished.push_back((id, tracker.snapshot()));
        while self.finished.len() > self.keep {
            self.finished.pop_front();
        }
    }

    fn get(&self, id: i64) -> Option<ProgressSnapshot> {
        if let Some(tracker) = self.live.get(&id) {
            return Some(tracker.snapshot());
        }
        self.finished
            .iter()
            .rev()
            .find(|(done, _)| *done == id)
            .map(|(_, snapshot)| *snapshot)
    }
}

/// Queues scans onto tokio tasks that share a [`ThreadSafeEngine`].
pub struct ScanService {
    engine: Arc<ThreadSafeEngine>,
    registry: Arc<dyn ScanRegistry>,
    progress: Arc<Mutex<ProgressBook>>,
    tasks: AsyncMutex<JoinSet<()>>,
}

impl ScanService {
    pub fn new(engine: Arc<ThreadSafeEngine>, registry: Arc<dyn ScanRegistry>) -> Self {
        Self {
            engine,
            registry,
            progress: Arc::new(Mutex::new(ProgressBook::new(FINISHED_SCANS_KEPT))),
            tasks: AsyncMutex::new(JoinSet::new()),
        }
    }

    /// How many finished scans keep reporting their final progress.
    pub fn keep_finished(self, keep: usize) -> Self {
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keep = keep;
        self
    }

    pub fn registry(&self) -> &Arc<dyn ScanRegistry> {
        &self.registry
    }

    /// Register a scan. Scans marked `run_now` start right away.
    pub async fn submit(&self, scan: NewScan) -> Result<i64> {
        let run_now = scan.run_now;
        let id = self.registry.add_scan(scan).await?;
        info!(scan = id, run_now, "scan registered");
        if run_now {
            self.run(id).await?;
        }
        Ok(id)
    }

    /// Start a registered scan in the background.
    pub async fn run(&self, id: i64) -> Result<()> {
        let record = self
            .registry
            .scan(id)
            .await?
            .with_context(|| format!("scan {id} not found"))?;

        let tracker = Arc::new(ProgressTracker::new());
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .start(id, Arc::clone(&tracker));

        let engine = Arc::clone(&self.engine);
        let registry = Arc::clone(&self.registry);
        let book = Arc::clone(&self.progress);
        let mut tasks = self.tasks.lock().await;
        while let Some(joined) = tasks.try_join_next() {
            if let Err(e) = joined {
                error!(error = %e, "scan task panicked");
            }
        }
        tasks.spawn(async move {
            if let Err(e) = run_scan(engine, registry, record, tracker).await {
                error!(scan = id, error = %format!("{e:#}"), "scan bookkeeping failed");
            }
            book.lock().unwrap_or_else(PoisonError::into_inner).finish(id);
        });
        Ok(())
    }

    /// Counters of a running scan, or the final counters of a recently
    /// finished one.
    pub fn progress(&self, id: i64) -> Option<ProgressSnapshot> {
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
    }

    /// Scans started by this service that have not finished yet.
    pub fn running(&self) -> usize {
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .live
            .len()
    }

    /// Wait for every scan started so far. New scans cannot start meanwhile.
    pub async fn drain(&self) {
        let mut tasks = self.tasks.lock().await;
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "scan task panicked");
            }
        }
    }
}

async fn run_scan(
    engine: Arc<ThreadSafeEngine>,
    registry: Arc<dyn ScanRegistry>,
    record: ScanRecord,
    tracker: Arc<ProgressTracker>,
) -> Result<()> {
    let id = record.id;
    registry.set_status(id, ScanStatus::Running).await?;
    let started = Instant::now();

    let tracker: Arc<dyn Progress> = tracker;
    let hooks = InvocationHooks {
        progress: Some(tracker),
        ..Default::default()
    };
    let options = template_options(&record.scan.templates);
    let status = match engine
        .execute_with(&record.scan.targets, options, hooks)
        .await
    {
        Ok(()) => ScanStatus::Done,
        Err(e) => {
            warn!(scan = id, error = %e, "scan failed");
            ScanStatus::Failed
        }
    };

    let elapsed = started.elapsed();
    registry.finish(id, status, elapsed).await?;
    info!(scan = id, %status, elapsed_ms = elapsed.as_millis() as u64, "scan finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ScanOptions;

    #[test]
    fn templates_split_into_paths_and_ids() {
        let entries = vec![
            "cves/2024".to_string(),
            "tech-detect".to_string(),
            "exposed.yaml".to_string(),
        ];
        let mut options = ScanOptions::default();
        crate::options::apply(&mut options, template_options(&entries)).unwrap();
        assert_eq!(
            options.templates,
            vec![PathBuf::from("cves/2024"), PathBuf::from("exposed.yaml")]
        );
        assert_eq!(options.template_ids, vec!["tech-detect".to_string()]);
    }

    #[test]
    fn no_templates_means_no_options() {
        assert!(template_options(&[]).is_empty());
    }

    #[test]
    fn progress_book_keeps_only_recent_finished_scans() {
        let mut book = ProgressBook::new(2);
        for id in 1..=3 {
            let tracker = Arc::new(ProgressTracker::new());
            tracker.matched();
            book.start(id, tracker);
        }
        assert_eq!(book.live.len(), 3);

        for id in 1..=3 {
            book.finish(id);
        }
        assert!(book.live.is_empty());
        assert!(book.get(1).is_none());
        assert_eq!(book.get(2).unwrap().matched, 1);
        assert_eq!(book.get(3).unwrap().matched, 1);
    }

    #[test]
    fn progress_book_without_history_forgets_on_finish() {
        let mut book = ProgressBook::new(0);
        book.start(7, Arc::new(ProgressTracker::new()));
        assert!(book.get(7).is_some());
        book.finish(7);
        assert!(book.get(7).is_none());
        assert!(book.finished.is_empty());
    }
}
