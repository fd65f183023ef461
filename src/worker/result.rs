//! The `result.json` handoff between a bootstrap subprocess and its runner.
//!
//! The bootstrap side writes the file once, atomically (temp file, fsync,
//! rename), so the runner either sees a complete file or none at all.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::scheduler::JobStatus;

pub const RESULT_FILENAME: &str = "result.json";
pub const RESULT_TMP_FILENAME: &str = "result.json.tmp";

#[derive(Debug, Error)]
pub enum ResultFileError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed result file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Result file reports non-terminal status {0}")]
    NotTerminal(JobStatus),
}

/// Content of `result.json`: `{"status", "result", "error"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultFile {
    pub status: JobStatus,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<Value>,
}

impl ResultFile {
    pub fn completed(result: Value) -> Self {
        Self {
            status: JobStatus::Completed,
            result,
            error: None,
        }
    }

    pub fn failed(error: Value) -> Self {
        Self {
            status: JobStatus::Failed,
            result: Value::Null,
            error: Some(error),
        }
    }

    pub fn path_in(job_path: &Path) -> PathBuf {
        job_path.join(RESULT_FILENAME)
    }

    pub fn tmp_path_in(job_path: &Path) -> PathBuf {
        job_path.join(RESULT_TMP_FILENAME)
    }

    /// Remove any result file (and leftover temp file) from `job_path`.
    ///
    /// Runs before a job starts so that only what its bootstrap writes can
    /// be read back as its result.
    pub async fn clear(job_path: &Path) -> Result<(), ResultFileError> {
        for path in [Self::path_in(job_path), Self::tmp_path_in(job_path)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => tracing::warn!(path = %path.display(), "Removed stale result file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(ResultFileError::Io { path, source }),
            }
        }
        Ok(())
    }

    /// Write the file into `job_path` so that readers never observe a partial write.
    pub async fn write_atomic(&self, job_path: &Path) -> Result<PathBuf, ResultFileError> {
        let final_path = Self::path_in(job_path);
        let tmp_path = Self::tmp_path_in(job_path);
        let bytes = serde_json::to_vec(self)?;

        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: io::Error| ResultFileError::Io { path, source }
        };

        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(io_err(&tmp_path))?;
        file.write_all(&bytes).await.map_err(io_err(&tmp_path))?;
        file.flush().await.map_err(io_err(&tmp_path))?;
        file.sync_all().await.map_err(io_err(&tmp_path))?;
        drop(file);

        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(io_err(&final_path))?;
        Ok(final_path)
    }

    /// Read `result.json` from `job_path`. A missing file is `Ok(None)`.
    pub async fn read(job_path: &Path) -> Result<Option<Self>, ResultFileError> {
        let path = Self::path_in(job_path);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(ResultFileError::Io { path, source }),
        };
        let file: ResultFile = serde_json::from_slice(&bytes)?;
        if !file.status.is_terminal() {
            return Err(ResultFileError::NotTerminal(file.status));
        }
        Ok(Some(file))
    }
}
