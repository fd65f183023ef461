//! Job execution.
//!
//! Workers take jobs off the queue and run each one in its own bootstrap
//! subprocess that attaches to the shared browser:
//!
//! - [`WorkerPool`]: fixed number of workers, drained on shutdown
//! - [`JobRunner`]: spawns, supervises and times out one subprocess
//! - [`result`]: the `result.json` contract between runner and subprocess
//! - [`process`]: process-group signalling with escalation
//!
//! # Execution Flow
//!
//! 1. A worker dequeues a job
//! 2. [`JobRunner::run`] marks it RUNNING and spawns the bootstrap program
//! 3. The bootstrap program runs the task script and writes `result.json`
//! 4. The runner reads the file, records the final status and releases the
//!    job name
//!
//! # Security Note
//!
//! Task scripts run with the server's privileges. The subprocess boundary
//! isolates crashes and hangs, not hostile code.

pub mod pool;
pub mod process;
pub mod result;
pub mod runner;

pub use pool::WorkerPool;
pub use result::{ResultFile, ResultFileError, RESULT_FILENAME, RESULT_TMP_FILENAME};
pub use runner::{Failure, JobOutcome, JobRunner};
