use std::io;
use std::panic::AssertUnwindSafe;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::browser::{SharedEngine, ENDPOINT_ENV};
use crate::config::RunnerConfig;
use crate::scheduler::{JobStatus, QueuedJob, StateManager};
use crate::worker::process;
use crate::worker::result::ResultFile;

/// Maximum stdout or stderr captured per stream (10 MiB). Anything beyond is
/// read and discarded so the child never blocks on a full pipe.
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Final status and payload of one job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub result: Value,
}

/// Failures detected by the runner itself, stored as the job's result.
/// Script failures are reported by the bootstrap program instead.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum Failure {
    Timeout {
        error: String,
        timeout_secs: f64,
        stdout: String,
        stderr: String,
        partial_result: Option<Value>,
    },
    Protocol {
        error: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    System {
        error: String,
    },
}

impl JobOutcome {
    pub fn failed(failure: Failure) -> Self {
        let result = serde_json::to_value(&failure)
            .unwrap_or_else(|e| json!({ "cause": "system", "error": e.to_string() }));
        Self {
            status: JobStatus::Failed,
            result,
        }
    }

    /// A completed file contributes its `result`; a failed one its `error`
    /// (or its `result` when no error was given).
    pub fn from_result_file(file: ResultFile) -> Self {
        match file.status {
            JobStatus::Completed => Self {
                status: JobStatus::Completed,
                result: file.result,
            },
            _ => Self {
                status: JobStatus::Failed,
                result: file.error.unwrap_or(file.result),
            },
        }
    }
}

enum Exit {
    Exited(ExitStatus),
    TimedOut,
    Stopped,
    WaitFailed(io::Error),
}

/// Runs one job in its own bootstrap subprocess.
///
/// The subprocess gets the job's coordinates as arguments and the shared
/// browser endpoint in its environment. Its authoritative answer is the
/// `result.json` it leaves in the job directory; stdout and stderr are
/// only kept for diagnostics.
///
/// [`JobRunner::stop`] terminates whatever is running and fails every job
/// started afterwards; the worker pool calls it when its drain deadline
/// passes.
pub struct JobRunner {
    config: RunnerConfig,
    state: Arc<StateManager>,
    engine: Arc<dyn SharedEngine>,
    stop: CancellationToken,
}

impl JobRunner {
    pub fn new(config: RunnerConfig, state: Arc<StateManager>, engine: Arc<dyn SharedEngine>) -> Self {
        Self {
            config,
            state,
            engine,
            stop: CancellationToken::new(),
        }
    }

    /// Stop running jobs. In-flight subprocesses are terminated and their
    /// jobs end FAILED; jobs picked up later fail without spawning.
    pub fn stop(&self) {
        if !self.stop.is_cancelled() {
            tracing::warn!("Stopping job runner");
        }
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Run `job` to a terminal state.
    ///
    /// Marks the job RUNNING, executes it, records the outcome and releases
    /// the job name. Every failure, including a panic during execution, ends
    /// as a FAILED outcome; the name is released exactly once.
    pub async fn run(&self, job: &QueuedJob) -> JobOutcome {
        let started = Instant::now();
        tracing::info!(
            job_id = %job.job_id,
            job_name = %job.job_name,
            script = %job.script_path.display(),
            "Starting job"
        );
        self.state
            .update_status(job.job_id, JobStatus::Running, None, None)
            .await;

        let outcome = match AssertUnwindSafe(self.execute(job)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::error!(job_id = %job.job_id, "Job execution panicked");
                JobOutcome::failed(Failure::System {
                    error: "Job execution panicked".to_string(),
                })
            }
        };

        let duration = started.elapsed().as_secs_f64();
        self.state
            .update_status(
                job.job_id,
                outcome.status,
                Some(outcome.result.clone()),
                Some(duration),
            )
            .await;
        self.state.remove_name(&job.job_name).await;

        tracing::info!(
            job_id = %job.job_id,
            job_name = %job.job_name,
            status = %outcome.status,
            duration_secs = duration,
            "Job finished"
        );
        outcome
    }

    async fn execute(&self, job: &QueuedJob) -> JobOutcome {
        let Some(endpoint) = self.engine.endpoint() else {
            return JobOutcome::failed(Failure::System {
                error: "Shared browser is not available".to_string(),
            });
        };
        if self.stop.is_cancelled() {
            return JobOutcome::failed(Failure::System {
                error: "Server shut down before the job started".to_string(),
            });
        }
        if let Err(e) = ResultFile::clear(&job.job_path).await {
            tracing::error!(job_id = %job.job_id, error = %e, "Failed to clear stale result file");
            return JobOutcome::failed(Failure::System {
                error: format!("Failed to clear stale result file: {e}"),
            });
        }

        let mut cmd = Command::new(&self.config.bootstrap_program);
        cmd.args(&self.config.bootstrap_args)
            .arg(job.job_id.to_string())
            .arg(&job.script_path)
            .arg(&job.job_path)
            .env(ENDPOINT_ENV, endpoint)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(job_id = %job.job_id, error = %e, "Failed to spawn bootstrap program");
                return JobOutcome::failed(Failure::System {
                    error: format!(
                        "Failed to spawn bootstrap program {}: {e}",
                        self.config.bootstrap_program.display()
                    ),
                });
            }
        };
        let pid = child.id();

        let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
        let stderr_task = tokio::spawn(read_stream(child.stderr.take()));

        let exit = tokio::select! {
            waited = tokio::time::timeout(self.config.timeout, child.wait()) => match waited {
                Ok(Ok(status)) => Exit::Exited(status),
                Ok(Err(e)) => Exit::WaitFailed(e),
                Err(_) => {
                    tracing::warn!(
                        job_id = %job.job_id,
                        timeout_secs = self.config.timeout.as_secs_f64(),
                        "Job timed out, terminating"
                    );
                    Exit::TimedOut
                }
            },
            _ = self.stop.cancelled() => {
                tracing::warn!(job_id = %job.job_id, "Server shutting down, terminating job");
                Exit::Stopped
            }
        };
        if !matches!(exit, Exit::Exited(_)) {
            if let Err(e) = process::terminate(&mut child, self.config.kill_grace).await {
                tracing::error!(job_id = %job.job_id, error = %e, "Failed to terminate bootstrap program");
            }
        }
        // Leftovers from the task script share the bootstrap's process group.
        if let Some(pid) = pid {
            if let Err(e) = process::signal_group(pid, libc::SIGKILL) {
                tracing::warn!(job_id = %job.job_id, error = %e, "Failed to sweep process group");
            }
        }

        let stdout = collect(stdout_task, self.config.kill_grace).await;
        let stderr = collect(stderr_task, self.config.kill_grace).await;
        if !stderr.is_empty() {
            tracing::debug!(job_id = %job.job_id, stderr = %stderr, "Bootstrap stderr");
        }

        let file = ResultFile::read(&job.job_path).await;
        match exit {
            Exit::TimedOut => JobOutcome::failed(Failure::Timeout {
                error: format!(
                    "Job exceeded its {:.1}s timeout",
                    self.config.timeout.as_secs_f64()
                ),
                timeout_secs: self.config.timeout.as_secs_f64(),
                stdout,
                stderr,
                partial_result: file
                    .ok()
                    .flatten()
                    .and_then(|file| serde_json::to_value(file).ok()),
            }),
            Exit::Stopped => JobOutcome::failed(Failure::System {
                error: "Job terminated by server shutdown".to_string(),
            }),
            Exit::WaitFailed(e) => JobOutcome::failed(Failure::System {
                error: format!("Failed waiting for bootstrap program: {e}"),
            }),
            Exit::Exited(status) => match file {
                Ok(Some(file)) => JobOutcome::from_result_file(file),
                Ok(None) => {
                    tracing::error!(job_id = %job.job_id, exit = %status, "Bootstrap exited without a result file");
                    JobOutcome::failed(Failure::Protocol {
                        error: "Result file missing after bootstrap exit".to_string(),
                        exit_code: status.code(),
                        stdout,
                        stderr,
                    })
                }
                Err(e) => {
                    tracing::error!(job_id = %job.job_id, error = %e, "Unreadable result file");
                    JobOutcome::failed(Failure::Protocol {
                        error: format!("Result file unreadable: {e}"),
                        exit_code: status.code(),
                        stdout,
                        stderr,
                    })
                }
            },
        }
    }

}

/// Output of a reader task, waiting at most `wait` for the pipe to close.
/// A reader still blocked after that (an escaped grandchild holding the
/// pipe) is aborted.
async fn collect(mut task: JoinHandle<Vec<u8>>, wait: Duration) -> String {
    match tokio::time::timeout(wait, &mut task).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(_)) => String::new(),
        Err(_) => {
            task.abort();
            String::new()
        }
    }
}

/// Read a whole stream, keeping at most [`MAX_OUTPUT_BYTES`].
async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut h) = handle {
        let _ = (&mut h)
            .take(MAX_OUTPUT_BYTES as u64)
            .read_to_end(&mut buf)
            .await;
        let _ = tokio::io::copy(&mut h, &mut tokio::io::sink()).await;
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_failure_is_tagged() {
        let outcome = JobOutcome::failed(Failure::Timeout {
            error: "Job exceeded its 1.0s timeout".to_string(),
            timeout_secs: 1.0,
            stdout: String::new(),
            stderr: String::new(),
            partial_result: None,
        });
        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.result["cause"], "timeout");
        assert_eq!(outcome.result["timeout_secs"], 1.0);
        assert!(outcome.result["partial_result"].is_null());
    }

    #[test]
    fn completed_file_result_is_kept_verbatim() {
        let outcome = JobOutcome::from_result_file(ResultFile::completed(json!({"k": "v"})));
        assert_eq!(outcome.status, JobStatus::Completed);
        assert_eq!(outcome.result, json!({"k": "v"}));
    }

    #[test]
    fn failed_file_contributes_its_error() {
        let outcome = JobOutcome::from_result_file(ResultFile::failed(
            json!({"cause": "script", "error": "boom"}),
        ));
        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.result["error"], "boom");

        let without_error = ResultFile {
            status: JobStatus::Failed,
            result: json!("partial"),
            error: None,
        };
        assert_eq!(
            JobOutcome::from_result_file(without_error).result,
            json!("partial")
        );
    }

    #[tokio::test]
    async fn collect_aborts_a_reader_that_never_finishes() {
        let marker = Arc::new(());
        let held = marker.clone();
        let reader = tokio::spawn(async move {
            let _held = held;
            std::future::pending::<()>().await;
            Vec::new()
        });

        let output = collect(reader, Duration::from_millis(50)).await;
        assert!(output.is_empty());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(Arc::strong_count(&marker), 1, "reader task should be dropped");
    }

    #[tokio::test]
    async fn collect_returns_finished_output() {
        let reader = tokio::spawn(async { b"hello".to_vec() });
        assert_eq!(collect(reader, Duration::from_secs(1)).await, "hello");
    }

    #[tokio::test]
    async fn read_stream_caps_but_drains() {
        let data = vec![b'x'; MAX_OUTPUT_BYTES + 1024];
        let captured = read_stream(Some(&data[..])).await;
        assert_eq!(captured.len(), MAX_OUTPUT_BYTES);
    }
}
