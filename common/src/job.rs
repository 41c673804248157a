use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{JobError, Result};

pub type JobId = String;

/// Tipos de job que acepta el motor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    BootstrapSingle,
    BootstrapDual,
    KwPermutation,
    DescriptiveOnly,
}

impl JobType {
    pub const ALL: [JobType; 4] = [
        JobType::BootstrapSingle,
        JobType::BootstrapDual,
        JobType::KwPermutation,
        JobType::DescriptiveOnly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::BootstrapSingle => "BOOTSTRAP_SINGLE",
            JobType::BootstrapDual => "BOOTSTRAP_DUAL",
            JobType::KwPermutation => "KW_PERMUTATION",
            JobType::DescriptiveOnly => "DESCRIPTIVE_ONLY",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| JobError::validation("INVALID_JOB_TYPE", "Unsupported jobType."))
    }
}

/// QUEUED -> RUNNING -> {COMPLETED | FAILED | CANCELLED}
/// QUEUED -> CANCELLED (cancelado antes de arrancar)
/// QUEUED -> FAILED (rechazado por el semáforo)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Failed)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JobProgress {
    pub percent: f64,
    pub step: Option<String>,
    pub message: Option<String>,
}

impl JobProgress {
    pub fn completed() -> Self {
        Self {
            percent: 100.0,
            step: Some("completed".to_string()),
            message: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub job_id: JobId,
    pub job_type: JobType,
    pub status: JobStatus,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Handle de la ejecución asíncrona (worker + id de tarea)
    pub task_id: Option<String>,
    #[serde(default)]
    pub progress: JobProgress,
    pub error: Option<String>,
}

impl JobRecord {
    pub fn new(job_id: impl Into<JobId>, job_type: JobType, created_at: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.into(),
            job_type,
            status: JobStatus::Queued,
            created_at,
            started_at: None,
            finished_at: None,
            task_id: None,
            progress: JobProgress::default(),
            error: None,
        }
    }

    /// Falla con `InvalidState` si el job ya está en un estado terminal.
    pub fn ensure_active(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(self.invalid_state());
        }
        Ok(())
    }

    /// Aplica una transición de estado respetando la máquina de estados.
    /// `started_at` y `finished_at` se fijan una sola vez.
    pub fn transition(
        &mut self,
        next: JobStatus,
        at: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(self.invalid_state());
        }

        if next == JobStatus::Running && self.started_at.is_none() {
            self.started_at = Some(at);
        }
        if next.is_terminal() && self.finished_at.is_none() {
            self.finished_at = Some(at);
        }

        self.error = match next {
            JobStatus::Failed | JobStatus::Cancelled => error.map(str::to_string),
            _ => None,
        };
        self.status = next;
        Ok(())
    }

    /// Sólo pisa los campos presentes; el porcentaje se acota a [0, 100].
    pub fn set_progress(
        &mut self,
        percent: Option<f64>,
        step: Option<&str>,
        message: Option<&str>,
    ) -> Result<()> {
        self.ensure_active()?;

        if let Some(p) = percent {
            self.progress.percent = if p.is_finite() { p.clamp(0.0, 100.0) } else { 0.0 };
        }
        if let Some(s) = step {
            self.progress.step = Some(s.to_string());
        }
        if let Some(m) = message {
            self.progress.message = Some(m.to_string());
        }
        Ok(())
    }

    pub fn set_task_id(&mut self, task_id: &str) -> Result<()> {
        self.ensure_active()?;
        self.task_id = Some(task_id.to_string());
        Ok(())
    }

    fn invalid_state(&self) -> JobError {
        JobError::InvalidState {
            job_id: self.job_id.clone(),
            status: self.status,
        }
    }
}
