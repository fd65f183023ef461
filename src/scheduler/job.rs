use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// Completed and failed jobs never change status again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// `Pending -> Failed` is allowed for jobs that fail before a runner
    /// picks them up (e.g. a worker-level error); `Pending -> Completed` is not.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "PENDING"),
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::Completed => write!(f, "COMPLETED"),
            JobStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// A submitted job as tracked by the state manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub job_name: String,
    pub script_path: PathBuf,
    pub job_path: PathBuf,
    pub status: JobStatus,
    /// Success payload or structured failure; set only in terminal states.
    pub result: Option<Value>,
    pub submitted_at: DateTime<Utc>,
    /// Wall-clock seconds; set only in terminal states.
    pub duration: Option<f64>,
}

impl Job {
    pub fn new(job_id: Uuid, job_name: String, script_path: PathBuf, job_path: PathBuf) -> Self {
        Self {
            job_id,
            job_name,
            script_path,
            job_path,
            status: JobStatus::Pending,
            result: None,
            submitted_at: Utc::now(),
            duration: None,
        }
    }
}

/// Coordinates handed from the dispatcher to a worker through the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub job_id: Uuid,
    pub job_name: String,
    pub script_path: PathBuf,
    pub job_path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_only() {
        use JobStatus::*;

        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Failed));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Running.can_transition_to(Running));
        for terminal in [Completed, Failed] {
            for next in [Pending, Running, Completed, Failed] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn status_serializes_uppercase() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Completed).unwrap(),
            "\"COMPLETED\""
        );
        let parsed: JobStatus = serde_json::from_str("\"FAILED\"").unwrap();
        assert_eq!(parsed, JobStatus::Failed);
        assert_eq!(JobStatus::Running.to_string(), "RUNNING");
    }

    #[test]
    fn new_job_is_pending_without_result() {
        let job = Job::new(
            Uuid::new_v4(),
            "crawl".to_string(),
            PathBuf::from("/jobs/a/script.py"),
            PathBuf::from("/jobs/a"),
        );
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.result.is_none());
        assert!(job.duration.is_none());
    }
}
