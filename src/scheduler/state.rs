use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::scheduler::job::{Job, JobStatus};

/// Job records plus the set of job names currently in flight.
///
/// The two maps sit behind independent locks so that status updates from
/// workers never block duplicate-name checks from submitters.
#[derive(Debug, Default)]
pub struct StateManager {
    jobs: Mutex<HashMap<Uuid, Job>>,
    names: Mutex<HashSet<String>>,
}

impl StateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a PENDING record. Returns false (and leaves the existing record
    /// alone) if `job_id` is already known.
    pub async fn set_initial(
        &self,
        job_id: Uuid,
        job_name: &str,
        script_path: PathBuf,
        job_path: PathBuf,
    ) -> bool {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&job_id) {
            tracing::warn!(job_id = %job_id, "Job ID already exists during initialization");
            return false;
        }
        jobs.insert(
            job_id,
            Job::new(job_id, job_name.to_string(), script_path, job_path),
        );
        tracing::debug!(job_id = %job_id, job_name, "Initial status set: PENDING");
        true
    }

    /// Move a job to `status`, merging in `result` and `duration` when given.
    ///
    /// Unknown ids and transitions the state machine forbids are ignored with
    /// a warning. Returns whether the record changed.
    pub async fn update_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        result: Option<Value>,
        duration: Option<f64>,
    ) -> bool {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(&job_id) else {
            tracing::warn!(job_id = %job_id, %status, "Status update for unknown job ID");
            return false;
        };
        if !job.status.can_transition_to(status) {
            tracing::warn!(
                job_id = %job_id,
                from = %job.status,
                to = %status,
                "Rejected backward or skipping status transition"
            );
            return false;
        }

        job.status = status;
        if result.is_some() {
            job.result = result;
        }
        if duration.is_some() {
            job.duration = duration;
        }
        tracing::debug!(job_id = %job_id, %status, "Job status updated");
        true
    }

    pub async fn get_info(&self, job_id: Uuid) -> Option<Job> {
        self.jobs.lock().await.get(&job_id).cloned()
    }

    pub async fn get_status(&self, job_id: Uuid) -> Option<JobStatus> {
        self.jobs.lock().await.get(&job_id).map(|job| job.status)
    }

    /// Drop a job record. Returns the removed record, if any.
    pub async fn remove(&self, job_id: Uuid) -> Option<Job> {
        let removed = self.jobs.lock().await.remove(&job_id);
        if removed.is_some() {
            tracing::info!(job_id = %job_id, "Removed job state");
        }
        removed
    }

    /// Number of tracked jobs in each status.
    pub async fn count_by_status(&self) -> HashMap<JobStatus, usize> {
        let jobs = self.jobs.lock().await;
        let mut counts = HashMap::new();
        for job in jobs.values() {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        counts
    }

    /// Check-and-insert a job name into the in-flight set.
    ///
    /// Returns false if the name is already in flight (duplicate submission).
    pub async fn add_name(&self, job_name: &str) -> bool {
        let mut names = self.names.lock().await;
        if !names.insert(job_name.to_string()) {
            tracing::warn!(job_name, "Duplicate job submission detected");
            return false;
        }
        tracing::debug!(job_name, "Job name added to in-flight set");
        true
    }

    /// Remove a job name from the in-flight set. Removing an absent name is a no-op.
    pub async fn remove_name(&self, job_name: &str) {
        self.names.lock().await.remove(job_name);
        tracing::debug!(job_name, "Job name removed from in-flight set");
    }

    pub async fn is_name_in_flight(&self, job_name: &str) -> bool {
        self.names.lock().await.contains(job_name)
    }
}
