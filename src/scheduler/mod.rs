//! Job bookkeeping: the job model, the FIFO queue, the state manager and
//! the dispatcher that ties submission to all three.

pub mod dispatcher;
pub mod job;
pub mod queue;
pub mod state;

pub use dispatcher::Dispatcher;
pub use job::{Job, JobStatus, QueuedJob};
pub use queue::{JobQueue, QueueEntry};
pub use state::StateManager;
