use std::path::PathBuf;

use thiserror::Error;

use crate::job::{JobId, JobStatus};
use crate::kw_zip::KwZipError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Job {0} not found.")]
    NotFound(JobId),

    #[error("Artifact {0} not found.")]
    ArtifactNotFound(String),

    #[error("Job {job_id} is already {status}.")]
    InvalidState { job_id: JobId, status: JobStatus },

    #[error("Job {0} is not completed.")]
    NotReady(JobId),

    #[error("Job {0} was modified concurrently too many times.")]
    Conflict(JobId),

    #[error("{message}")]
    Validation { code: &'static str, message: String },

    #[error(transparent)]
    Bundle(#[from] KwZipError),

    #[error(
        "Unsafe path traversal attempted outside {}: {}",
        .base.display(),
        .candidate.display()
    )]
    PathTraversal { base: PathBuf, candidate: PathBuf },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl JobError {
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        JobError::Validation {
            code,
            message: message.into(),
        }
    }

    /// Código estable que la capa de intake devuelve tal cual.
    pub fn code(&self) -> &'static str {
        match self {
            JobError::NotFound(_) | JobError::ArtifactNotFound(_) => "NOT_FOUND",
            JobError::InvalidState { .. } => "INVALID_STATE",
            JobError::NotReady(_) => "NOT_READY",
            JobError::Conflict(_) => "CONFLICT",
            JobError::Validation { code, .. } => *code,
            JobError::Bundle(e) => e.code.as_str(),
            JobError::PathTraversal { .. } => "INVALID_PATH",
            JobError::Store(_) | JobError::Io(_) | JobError::Json(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, JobError>;
