//! Job storage abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;

use transcriber_core::{
    DomainError, Job, JobId, JobKind, JobStatus, SourceMedia, SourceMediaId, TerminalOutcome,
    TranscriptResult,
};

/// A pending job joined with the media it refers to.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingJob {
    pub job: Job,
    pub media: SourceMedia,
}

/// Result of trying to move a job from `pending` to `running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This worker now owns the job.
    Claimed,
    /// The job was no longer pending (another worker got it first).
    AlreadyClaimed,
}

/// Job store abstraction.
///
/// Every write is individually transactional. Callers drive the lifecycle:
/// `mark_terminal` is only valid after a successful `mark_running` claim.
pub trait JobStore: Send + Sync {
    /// Up to `limit` pending transcription jobs with their media, oldest first.
    ///
    /// Returns an empty vector when there is nothing to do; never waits for work.
    fn fetch_pending(&self, limit: usize) -> Result<Vec<PendingJob>, JobStoreError>;

    /// Claim a job: `pending -> running`, stamping `started_at`.
    ///
    /// The update is conditional on the job still being pending, so at most one
    /// caller observes `ClaimOutcome::Claimed` for a given job.
    fn mark_running(&self, job_id: JobId) -> Result<ClaimOutcome, JobStoreError>;

    /// Finish a running job, stamping `completed_at` and the error message of a failure.
    fn mark_terminal(&self, job_id: JobId, outcome: &TerminalOutcome) -> Result<(), JobStoreError>;

    /// Insert or replace the transcript of a media asset.
    ///
    /// Keyed by `media_id`: a second call for the same media overwrites the
    /// mutable fields of the first. Readers never see a partially written result.
    fn upsert_result(
        &self,
        media_id: SourceMediaId,
        result: &TranscriptResult,
    ) -> Result<(), JobStoreError>;
}

impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    fn fetch_pending(&self, limit: usize) -> Result<Vec<PendingJob>, JobStoreError> {
        (**self).fetch_pending(limit)
    }

    fn mark_running(&self, job_id: JobId) -> Result<ClaimOutcome, JobStoreError> {
        (**self).mark_running(job_id)
    }

    fn mark_terminal(&self, job_id: JobId, outcome: &TerminalOutcome) -> Result<(), JobStoreError> {
        (**self).mark_terminal(job_id, outcome)
    }

    fn upsert_result(
        &self,
        media_id: SourceMediaId,
        result: &TranscriptResult,
    ) -> Result<(), JobStoreError> {
        (**self).upsert_result(media_id, result)
    }
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    /// The store could not be reached at all (startup).
    #[error("job store unreachable: {0}")]
    Connectivity(String),
    /// A single store operation failed.
    #[error("{operation} failed: {message}")]
    Persistence {
        operation: &'static str,
        message: String,
    },
    #[error("job not found: {0}")]
    NotFound(JobId),
    /// The write would break the job lifecycle or a record invariant.
    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl JobStoreError {
    pub fn persistence(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Persistence {
            operation,
            message: message.into(),
        }
    }
}

/// Reject a result whose media reference disagrees with the upsert key.
pub(crate) fn ensure_result_matches(
    media_id: SourceMediaId,
    result: &TranscriptResult,
) -> Result<(), JobStoreError> {
    if result.media_id != media_id {
        return Err(DomainError::invariant(format!(
            "transcript for media {} written under media {}",
            result.media_id, media_id
        ))
        .into());
    }
    Ok(())
}

/// In-memory job store for tests/dev.
///
/// Applies transitions through [`Job`], so an out-of-order write is rejected
/// the same way the database guard rejects it.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    media: RwLock<HashMap<SourceMediaId, SourceMedia>>,
    results: RwLock<HashMap<SourceMediaId, TranscriptResult>>,
    history: RwLock<HashMap<JobId, Vec<JobStatus>>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a media asset jobs can refer to.
    pub fn insert_media(&self, media: SourceMedia) {
        self.media.write().unwrap().insert(media.id, media);
    }

    /// Add a job as an external scheduler would.
    pub fn enqueue(&self, job: Job) -> JobId {
        let id = job.id;
        self.history.write().unwrap().insert(id, vec![job.status]);
        self.jobs.write().unwrap().insert(id, job);
        id
    }

    pub fn job(&self, job_id: JobId) -> Option<Job> {
        self.jobs.read().unwrap().get(&job_id).cloned()
    }

    pub fn result_for(&self, media_id: SourceMediaId) -> Option<TranscriptResult> {
        self.results.read().unwrap().get(&media_id).cloned()
    }

    pub fn result_count(&self) -> usize {
        self.results.read().unwrap().len()
    }

    /// Every status the job has been in, in order.
    pub fn status_history(&self, job_id: JobId) -> Vec<JobStatus> {
        self.history
            .read()
            .unwrap()
            .get(&job_id)
            .cloned()
            .unwrap_or_default()
    }

    fn record(&self, job: &Job) {
        self.history
            .write()
            .unwrap()
            .entry(job.id)
            .or_default()
            .push(job.status);
    }
}

impl JobStore for InMemoryJobStore {
    fn fetch_pending(&self, limit: usize) -> Result<Vec<PendingJob>, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        let media = self.media.read().unwrap();

        // Inner join: jobs whose media is unknown are not visible.
        let mut pending: Vec<PendingJob> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending && j.kind == JobKind::Transcribe)
            .filter_map(|j| {
                media.get(&j.media_id).map(|m| PendingJob {
                    job: j.clone(),
                    media: m.clone(),
                })
            })
            .collect();

        // FIFO by creation time; id breaks ties deterministically.
        pending.sort_by_key(|p| (p.job.created_at, p.job.id));
        pending.truncate(limit);
        Ok(pending)
    }

    fn mark_running(&self, job_id: JobId) -> Result<ClaimOutcome, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;

        if job.status != JobStatus::Pending {
            return Ok(ClaimOutcome::AlreadyClaimed);
        }
        job.mark_running(Utc::now())?;
        self.record(job);
        Ok(ClaimOutcome::Claimed)
    }

    fn mark_terminal(&self, job_id: JobId, outcome: &TerminalOutcome) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;

        job.mark_terminal(outcome, Utc::now())?;
        self.record(job);
        Ok(())
    }

    fn upsert_result(
        &self,
        media_id: SourceMediaId,
        result: &TranscriptResult,
    ) -> Result<(), JobStoreError> {
        ensure_result_matches(media_id, result)?;
        self.results
            .write()
            .unwrap()
            .insert(media_id, result.clone());
        Ok(())
    }
}
