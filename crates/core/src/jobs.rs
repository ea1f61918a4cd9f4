//! Processing job status and service health payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use storage::{KeyValueStore, StorageError};

pub const JOBS_KEY: &str = "clinical_jobs";
pub const SERVICE_NAME: &str = "clinical-extract";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    pub session_id: String,
    pub form_id: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Session ID is required")]
    MissingSessionId,

    #[error("Invalid session ID format")]
    InvalidSessionId,

    #[error("Job with ID {0} not found")]
    NotFound(String),

    #[error("progress must be between 0 and 100, got {0}")]
    InvalidProgress(u8),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("job records are unreadable: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Rejects blank ids and anything that could walk a path.
pub fn validate_session_id(session_id: &str) -> Result<(), JobError> {
    if session_id.trim().is_empty() {
        return Err(JobError::MissingSessionId);
    }
    if session_id.contains("..") || session_id.contains('/') {
        return Err(JobError::InvalidSessionId);
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthPayload {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub service: &'static str,
}

pub fn health_payload(now: DateTime<Utc>) -> HealthPayload {
    HealthPayload { status: "healthy", timestamp: now, service: SERVICE_NAME }
}

/// Body of a job-status lookup. `timestamp` is milliseconds since the epoch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub session_id: String,
    pub job: Option<JobRecord>,
    pub timestamp: i64,
}

/// Job records persisted as one JSON list in a key-value store.
pub struct JobRegistry {
    storage: Arc<dyn KeyValueStore>,
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry").finish_non_exhaustive()
    }
}

impl JobRegistry {
    pub fn new(storage: Arc<dyn KeyValueStore>) -> Self {
        Self { storage }
    }

    fn load(&self) -> Result<Vec<JobRecord>, JobError> {
        match self.storage.get(JOBS_KEY)? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    fn save(&self, jobs: &[JobRecord]) -> Result<(), JobError> {
        self.storage.set(JOBS_KEY, &serde_json::to_string(jobs)?)?;
        Ok(())
    }

    fn modify(
        &self,
        job_id: &str,
        apply: impl FnOnce(&mut JobRecord),
    ) -> Result<JobRecord, JobError> {
        let mut jobs = self.load()?;
        let job = jobs
            .iter_mut()
            .find(|job| job.id == job_id)
            .ok_or_else(|| JobError::NotFound(job_id.to_owned()))?;
        apply(job);
        let updated = job.clone();

        self.save(&jobs)?;
        tracing::debug!(job = %updated.id, status = ?updated.status, "job updated");
        Ok(updated)
    }

    /// Creates a queued job for `session_id`.
    pub fn create(&self, session_id: &str, form_id: &str) -> Result<JobRecord, JobError> {
        validate_session_id(session_id)?;

        let job = JobRecord {
            id: format!("job_{}", uuid::Uuid::new_v4().simple()),
            session_id: session_id.to_owned(),
            form_id: form_id.to_owned(),
            status: JobStatus::Queued,
            progress: None,
            result: None,
            error: None,
            created_at: Utc::now(),
        };
        let mut jobs = self.load()?;
        jobs.push(job.clone());
        self.save(&jobs)?;

        tracing::info!(job = %job.id, session = %job.session_id, "job queued");
        Ok(job)
    }

    pub fn update_progress(
        &self,
        job_id: &str,
        progress: u8,
        status: Option<JobStatus>,
    ) -> Result<JobRecord, JobError> {
        if progress > 100 {
            return Err(JobError::InvalidProgress(progress));
        }

        self.modify(job_id, |job| {
            job.progress = Some(progress);
            if let Some(status) = status {
                job.status = status;
            }
        })
    }

    pub fn complete(&self, job_id: &str, result: serde_json::Value) -> Result<JobRecord, JobError> {
        self.modify(job_id, |job| {
            job.status = JobStatus::Completed;
            job.progress = Some(100);
            job.result = Some(result);
        })
    }

    pub fn fail(&self, job_id: &str, error: &str) -> Result<JobRecord, JobError> {
        self.modify(job_id, |job| {
            job.status = JobStatus::Failed;
            job.error = Some(error.to_owned());
        })
    }

    /// Most recently created job for the session, if any.
    pub fn status(&self, session_id: &str) -> Result<Option<JobRecord>, JobError> {
        validate_session_id(session_id)?;

        let jobs = self.load()?;
        Ok(jobs.into_iter().rev().find(|job| job.session_id == session_id))
    }

    pub fn status_response(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<JobStatusResponse, JobError> {
        Ok(JobStatusResponse {
            session_id: session_id.to_owned(),
            job: self.status(session_id)?,
            timestamp: now.timestamp_millis(),
        })
    }
}
