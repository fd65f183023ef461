use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{mpsc, watch, Mutex};

use crate::error::{DispatchError, Result};
use crate::scheduler::job::QueuedJob;

/// An item handed to a worker: a job, or the marker telling one worker to exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEntry {
    Job(QueuedJob),
    Shutdown,
}

/// Unbounded FIFO between submitters and workers.
///
/// Every entry put in the queue counts as unfinished until a worker calls
/// [`JobQueue::task_done`] for it; [`JobQueue::join`] waits for that count
/// to reach zero.
#[derive(Debug)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<QueueEntry>,
    rx: Mutex<mpsc::UnboundedReceiver<QueueEntry>>,
    queued: AtomicUsize,
    unfinished: watch::Sender<usize>,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (unfinished, _) = watch::channel(0);
        Self {
            tx,
            rx: Mutex::new(rx),
            queued: AtomicUsize::new(0),
            unfinished,
        }
    }

    /// Append a job to the back of the queue.
    pub fn enqueue(&self, job: QueuedJob) -> Result<()> {
        let job_id = job.job_id;
        self.push(QueueEntry::Job(job))?;
        tracing::debug!(job_id = %job_id, "Job added to queue");
        Ok(())
    }

    /// Put one shutdown marker per worker into the queue.
    pub fn put_shutdown_signals(&self, count: usize) -> Result<()> {
        for _ in 0..count {
            self.push(QueueEntry::Shutdown)?;
        }
        tracing::debug!(count, "Shutdown signals queued");
        Ok(())
    }

    fn push(&self, entry: QueueEntry) -> Result<()> {
        self.unfinished.send_modify(|n| *n += 1);
        self.queued.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(entry).is_err() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            self.unfinished.send_modify(|n| *n = n.saturating_sub(1));
            return Err(DispatchError::QueueClosed);
        }
        Ok(())
    }

    /// Wait for the next entry. Entries come out in the order they went in.
    ///
    /// Returns `None` only if the queue has been closed.
    pub async fn dequeue(&self) -> Option<QueueEntry> {
        let entry = self.rx.lock().await.recv().await?;
        self.queued.fetch_sub(1, Ordering::SeqCst);
        match &entry {
            QueueEntry::Job(job) => {
                tracing::debug!(job_id = %job.job_id, "Job retrieved from queue")
            }
            QueueEntry::Shutdown => tracing::debug!("Shutdown signal received from queue"),
        }
        Some(entry)
    }

    /// Mark one dequeued entry as fully processed.
    pub fn task_done(&self) {
        self.unfinished.send_modify(|n| {
            if *n == 0 {
                tracing::debug!("task_done() called when unfinished count is already zero");
            }
            *n = n.saturating_sub(1);
        });
    }

    /// Wait until every entry put in the queue has been marked done.
    pub async fn join(&self) {
        let mut rx = self.unfinished.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Number of entries waiting to be dequeued.
    pub fn len(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries enqueued but not yet marked done.
    pub fn unfinished(&self) -> usize {
        *self.unfinished.borrow()
    }
}
