//! Periodic cleanup of expired job directories.
//!
//! Spawns a background loop that deletes job working directories whose
//! modification time is older than the retention window and removes the
//! matching job records. Runs on a fixed interval using
//! `tokio::time::interval` until cancelled.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::RetentionConfig;
use crate::scheduler::StateManager;

/// What one sweep did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted: Vec<PathBuf>,
    /// Expired directories left alone because their job is still in flight.
    pub skipped: usize,
    pub errors: usize,
}

pub struct RetentionSweeper {
    root: PathBuf,
    config: RetentionConfig,
    state: Arc<StateManager>,
}

impl RetentionSweeper {
    pub fn new(root: PathBuf, config: RetentionConfig, state: Arc<StateManager>) -> Self {
        Self {
            root,
            config,
            state,
        }
    }

    /// Run the cleanup loop. The first sweep happens immediately.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(
            root = %self.root.display(),
            retention_secs = self.config.retention.as_secs(),
            interval_secs = self.config.interval.as_secs(),
            "Retention sweeper started"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Retention sweeper stopping");
                    break;
                }
                _ = interval.tick() => {
                    let report = self.sweep_once().await;
                    if report.deleted.is_empty() {
                        tracing::debug!(skipped = report.skipped, errors = report.errors, "Retention: nothing to delete");
                    } else {
                        tracing::info!(
                            deleted = report.deleted.len(),
                            skipped = report.skipped,
                            errors = report.errors,
                            "Retention: purged expired jobs"
                        );
                    }
                }
            }
        }
    }

    /// One pass over the job root.
    ///
    /// A directory is deleted when its age is strictly greater than the
    /// retention window and its job, if known, is terminal. Errors on one
    /// entry are logged and the pass continues.
    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let Some(cutoff) = SystemTime::now().checked_sub(self.config.retention) else {
            return report;
        };

        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(root = %self.root.display(), "Job root does not exist, skipping cleanup");
                return report;
            }
            Err(e) => {
                tracing::error!(root = %self.root.display(), error = %e, "Failed to list job root");
                report.errors += 1;
                return report;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(root = %self.root.display(), error = %e, "Failed to read job root entry");
                    report.errors += 1;
                    break;
                }
            };
            let path = entry.path();
            match self.sweep_entry(&path, cutoff).await {
                Ok(Swept::Deleted) => report.deleted.push(path),
                Ok(Swept::InFlight) => report.skipped += 1,
                Ok(Swept::Kept) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    tracing::warn!(path = %path.display(), "Entry vanished during cleanup");
                }
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "Failed to clean up job directory");
                    report.errors += 1;
                }
            }
        }
        report
    }

    async fn sweep_entry(&self, path: &Path, cutoff: SystemTime) -> io::Result<Swept> {
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_dir() || metadata.modified()? >= cutoff {
            return Ok(Swept::Kept);
        }

        let job_id = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| Uuid::parse_str(name).ok());
        if let Some(job_id) = job_id {
            if let Some(status) = self.state.get_status(job_id).await {
                if !status.is_terminal() {
                    tracing::warn!(job_id = %job_id, status = %status, "Expired job still in flight, keeping its directory");
                    return Ok(Swept::InFlight);
                }
            }
        }

        tracing::info!(path = %path.display(), "Deleting expired job directory");
        tokio::fs::remove_dir_all(path).await?;
        if let Some(job_id) = job_id {
            self.state.remove(job_id).await;
        }
        Ok(Swept::Deleted)
    }
}

enum Swept {
    Deleted,
    InFlight,
    Kept,
}
