//! Error types for the job queue.

use crate::job::JobId;
use std::io::Error as IoError;
use std::path::PathBuf;
use thiserror::Error;

/// Job store persistence errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to read job store {0}: {1}")]
    FileRead(PathBuf, IoError),

    #[error("Failed to create file {0}: {1}")]
    FileCreate(PathBuf, IoError),

    #[error("Failed to write to file {0}: {1}")]
    FileWrite(PathBuf, IoError),

    #[error("Failed to sync file {0}: {1}")]
    FileSync(PathBuf, IoError),

    #[error("Failed to rename file from {0} to {1}: {2}")]
    FileRename(PathBuf, PathBuf, IoError),

    #[error("Failed to serialize jobs: {0}")]
    Serialization(serde_json::Error),

    #[error("Failed to deserialize job store {0}: {1}")]
    Deserialization(PathBuf, serde_json::Error),
}

/// Job queue errors
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(JobId),

    /// Requested transition is not allowed from the job's current status
    #[error("{0}")]
    InvalidState(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type JobResult<T> = Result<T, JobError>;
