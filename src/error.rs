use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::browser::BrowserError;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Job with name \"{0}\" is already submitted and processing")]
    DuplicateName(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Job ID already exists: {0}")]
    JobExists(Uuid),

    #[error("Job directory does not exist: {}", .0.display())]
    MissingJobPath(PathBuf),

    #[error("Job queue is closed")]
    QueueClosed,

    #[error("Shared browser error: {0}")]
    Browser(#[from] BrowserError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
