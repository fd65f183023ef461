use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::json;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::scheduler::{JobQueue, JobStatus, QueueEntry, StateManager};
use crate::worker::runner::JobRunner;

/// A fixed set of workers pulling jobs off the shared queue.
///
/// Each worker runs one job at a time, so at most `count` jobs run
/// concurrently.
pub struct WorkerPool {
    queue: Arc<JobQueue>,
    runner: Arc<JobRunner>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(
        count: usize,
        queue: Arc<JobQueue>,
        runner: Arc<JobRunner>,
        state: Arc<StateManager>,
    ) -> Self {
        let count = count.max(1);
        let handles = (0..count)
            .map(|worker_id| {
                let queue = queue.clone();
                let runner = runner.clone();
                let state = state.clone();
                tokio::spawn(async move {
                    Self::worker_loop(worker_id, queue, runner, state).await;
                })
            })
            .collect();
        tracing::info!(workers = count, "Worker pool started");
        Self {
            queue,
            runner,
            handles,
        }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Loop of a single worker.
    ///
    /// Takes the next entry, runs it if it is a job, and marks it done.
    /// A shutdown marker ends the loop. A panic while running a job fails
    /// that job and the worker moves on to the next one.
    async fn worker_loop(
        worker_id: usize,
        queue: Arc<JobQueue>,
        runner: Arc<JobRunner>,
        state: Arc<StateManager>,
    ) {
        tracing::debug!(worker_id, "Worker started");
        while let Some(entry) = queue.dequeue().await {
            let job = match entry {
                QueueEntry::Job(job) => job,
                QueueEntry::Shutdown => {
                    queue.task_done();
                    break;
                }
            };

            tracing::debug!(worker_id, job_id = %job.job_id, "Worker picked up job");
            if AssertUnwindSafe(runner.run(&job)).catch_unwind().await.is_err() {
                tracing::error!(worker_id, job_id = %job.job_id, "Worker panicked while running job");
                state
                    .update_status(
                        job.job_id,
                        JobStatus::Failed,
                        Some(json!({ "cause": "system", "error": "Worker panicked while running job" })),
                        None,
                    )
                    .await;
                state.remove_name(&job.job_name).await;
            }
            queue.task_done();
        }
        tracing::debug!(worker_id, "Worker stopped");
    }

    /// Stop every worker.
    ///
    /// Queues one shutdown marker per worker behind any pending jobs and
    /// waits up to `drain_timeout` for the queue to drain. If the deadline
    /// passes, the runner is stopped: running subprocesses are terminated
    /// and the remaining queued jobs fail without starting, so every job
    /// still reaches a terminal state and releases its name. Workers are
    /// then awaited to completion.
    pub async fn shutdown(self, drain_timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + drain_timeout;
        self.queue.put_shutdown_signals(self.handles.len())?;

        if tokio::time::timeout_at(deadline, self.queue.join()).await.is_err() {
            tracing::warn!(
                unfinished = self.queue.unfinished(),
                timeout_secs = drain_timeout.as_secs_f64(),
                "Timed out waiting for the job queue to drain, stopping running jobs"
            );
            self.runner.stop();
        }

        for (worker_id, handle) in self.handles.into_iter().enumerate() {
            if let Err(e) = handle.await {
                tracing::error!(worker_id, error = %e, "Worker task failed");
            }
        }
        tracing::info!("Worker pool stopped");
        Ok(())
    }
}
