//! Ordering guard for job status writes.
//!
//! A [`RunningJob`] can only be obtained from a successful claim, and finishing
//! it consumes it. That makes two rules hold by construction: no terminal write
//! happens without a prior `mark_running`, and each claimed job receives
//! exactly one terminal write.

use transcriber_core::{JobId, TerminalOutcome};

use super::store::{ClaimOutcome, JobStore, JobStoreError};

/// Claim a pending job.
///
/// Returns `Ok(None)` when another worker already owns the job.
pub fn claim<S: JobStore + ?Sized>(
    store: &S,
    job_id: JobId,
) -> Result<Option<RunningJob<'_, S>>, JobStoreError> {
    match store.mark_running(job_id)? {
        ClaimOutcome::Claimed => Ok(Some(RunningJob { store, job_id })),
        ClaimOutcome::AlreadyClaimed => Ok(None),
    }
}

/// A job this worker has moved to `running` and still has to finish.
#[must_use = "a claimed job must be completed or failed"]
pub struct RunningJob<'s, S: JobStore + ?Sized> {
    store: &'s S,
    job_id: JobId,
}

impl<S: JobStore + ?Sized> RunningJob<'_, S> {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// `running -> completed`. Only call once the transcript is stored.
    pub fn complete(self) -> Result<(), JobStoreError> {
        self.finish(TerminalOutcome::Completed)
    }

    /// `running -> failed`, recording `error`.
    pub fn fail(self, error: impl Into<String>) -> Result<(), JobStoreError> {
        self.finish(TerminalOutcome::failed(error))
    }

    pub fn finish(self, outcome: TerminalOutcome) -> Result<(), JobStoreError> {
        self.store.mark_terminal(self.job_id, &outcome)
    }
}

#[cfg(test)]
mod tests {
    use transcriber_core::{Job, JobStatus, SourceMedia, SourceMediaId};

    use super::*;
    use crate::jobs::store::InMemoryJobStore;

    fn store_with_job() -> (InMemoryJobStore, JobId) {
        let store = InMemoryJobStore::new();
        let media = SourceMedia::new(SourceMediaId::new(), "/audio/a.wav");
        let job = Job::new(media.id);
        store.insert_media(media);
        let id = store.enqueue(job);
        (store, id)
    }

    #[test]
    fn claim_and_fail() {
        let (store, job_id) = store_with_job();

        let running = claim(&store, job_id).unwrap().expect("job should be claimable");
        assert_eq!(running.job_id(), job_id);
        running.fail("engine crashed").unwrap();

        let job = store.job(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("engine crashed"));
    }

    #[test]
    fn lost_claim_yields_no_guard() {
        let (store, job_id) = store_with_job();

        let first = claim(&store, job_id).unwrap();
        assert!(first.is_some());
        assert!(claim(&store, job_id).unwrap().is_none());

        first.unwrap().complete().unwrap();
        assert_eq!(store.job(job_id).unwrap().status, JobStatus::Completed);
    }
}
