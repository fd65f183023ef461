use std::path::PathBuf;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::scheduler::job::{Job, JobStatus, QueuedJob};
use crate::scheduler::queue::JobQueue;
use crate::scheduler::state::StateManager;

/// Submission entry point used by the HTTP layer.
///
/// A submission is two steps: [`admit`](Self::admit) claims the job name
/// before anything is written to disk, then [`submit`](Self::submit) records
/// and queues the job once its directory is populated. A caller that gives
/// up in between must call [`release`](Self::release).
#[derive(Debug, Clone)]
pub struct Dispatcher {
    state: Arc<StateManager>,
    queue: Arc<JobQueue>,
}

impl Dispatcher {
    pub fn new(state: Arc<StateManager>, queue: Arc<JobQueue>) -> Self {
        Self { state, queue }
    }

    /// Claim `job_name` for a new submission.
    pub async fn admit(&self, job_name: &str) -> Result<()> {
        if self.state.add_name(job_name).await {
            Ok(())
        } else {
            Err(DispatchError::DuplicateName(job_name.to_string()))
        }
    }

    /// Give back a name claimed by [`admit`](Self::admit) without submitting.
    pub async fn release(&self, job_name: &str) {
        self.state.remove_name(job_name).await;
    }

    /// Record a PENDING job and queue it for a worker.
    ///
    /// `job_name` must have been admitted. On error the name is released.
    pub async fn submit(
        &self,
        job_id: Uuid,
        job_name: &str,
        script_path: PathBuf,
        job_path: PathBuf,
    ) -> Result<()> {
        let result = self
            .record_and_enqueue(job_id, job_name, script_path, job_path)
            .await;
        if let Err(e) = &result {
            tracing::error!(job_id = %job_id, job_name, error = %e, "Job submission failed");
            self.state.remove_name(job_name).await;
        }
        result
    }

    async fn record_and_enqueue(
        &self,
        job_id: Uuid,
        job_name: &str,
        script_path: PathBuf,
        job_path: PathBuf,
    ) -> Result<()> {
        let is_dir = tokio::fs::metadata(&job_path)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(DispatchError::MissingJobPath(job_path));
        }

        if !self
            .state
            .set_initial(job_id, job_name, script_path.clone(), job_path.clone())
            .await
        {
            return Err(DispatchError::JobExists(job_id));
        }

        let queued = QueuedJob {
            job_id,
            job_name: job_name.to_string(),
            script_path,
            job_path,
        };
        if let Err(e) = self.queue.enqueue(queued) {
            self.state
                .update_status(
                    job_id,
                    JobStatus::Failed,
                    Some(serde_json::json!({ "cause": "system", "error": e.to_string() })),
                    None,
                )
                .await;
            return Err(e);
        }

        tracing::info!(job_id = %job_id, job_name, "Job successfully queued");
        Ok(())
    }

    pub async fn status(&self, job_id: Uuid) -> Option<JobStatus> {
        self.state.get_status(job_id).await
    }

    pub async fn info(&self, job_id: Uuid) -> Option<Job> {
        self.state.get_info(job_id).await
    }

    /// Entries waiting in the queue.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}
