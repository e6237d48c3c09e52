//! Processing jobs and their status lifecycle.
//!
//! ```text
//! pending ──► running ──► completed
//!                    └──► failed
//! ```
//!
//! No transition skips `running` and none leaves a terminal state. Timestamps
//! are stamped on entry: `started_at` for `running`, `completed_at` for either
//! terminal state. `error_message` is present exactly when the job failed.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, SourceMediaId};

/// Job kind used for routing. This worker only handles transcription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Transcribe,
}

impl JobKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            JobKind::Transcribe => "transcribe",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transcribe" => Ok(JobKind::Transcribe),
            other => Err(DomainError::validation(format!("unknown job kind: {other}"))),
        }
    }
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be claimed
    Pending,
    /// Claimed by a worker and being executed
    Running,
    /// Finished successfully; a transcript was stored
    Completed,
    /// Finished with an error; no transcript was stored
    Failed,
}

impl JobStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// How a running job ended. Only `Failed` carries an error message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum TerminalOutcome {
    Completed,
    Failed { error: String },
}

impl TerminalOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
        }
    }

    pub fn status(&self) -> JobStatus {
        match self {
            TerminalOutcome::Completed => JobStatus::Completed,
            TerminalOutcome::Failed { .. } => JobStatus::Failed,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            TerminalOutcome::Completed => None,
            TerminalOutcome::Failed { error } => Some(error),
        }
    }
}

/// A transcription job as stored in the jobs table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    /// The audio asset to transcribe
    pub media_id: SourceMediaId,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    /// Set when the job enters `running`
    pub started_at: Option<DateTime<Utc>>,
    /// Set when the job enters `completed` or `failed`
    pub completed_at: Option<DateTime<Utc>>,
    /// Set only when the job failed
    pub error_message: Option<String>,
}

impl Job {
    /// Create a pending transcription job for a media asset.
    pub fn new(media_id: SourceMediaId) -> Self {
        Self {
            id: JobId::new(),
            kind: JobKind::Transcribe,
            media_id,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    /// Override the creation time (fixtures, backfills).
    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    /// Move `pending -> running`, stamping `started_at`.
    pub fn mark_running(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_transition(JobStatus::Running)?;
        self.status = JobStatus::Running;
        self.started_at = Some(at.max(self.created_at));
        Ok(())
    }

    /// Move `running -> completed|failed`, stamping `completed_at`.
    pub fn mark_terminal(&mut self, outcome: &TerminalOutcome, at: DateTime<Utc>) -> DomainResult<()> {
        let next = outcome.status();
        self.ensure_transition(next)?;
        let floor = self.started_at.unwrap_or(self.created_at);
        self.status = next;
        self.completed_at = Some(at.max(floor));
        self.error_message = outcome.error_message().map(str::to_owned);
        Ok(())
    }

    /// Check the record-level invariants (timestamps and error message).
    pub fn check_invariants(&self) -> DomainResult<()> {
        if self.error_message.is_some() != (self.status == JobStatus::Failed) {
            return Err(DomainError::invariant(format!(
                "job {} has status {} but error_message present = {}",
                self.id,
                self.status,
                self.error_message.is_some()
            )));
        }
        if let Some(started) = self.started_at {
            if started < self.created_at {
                return Err(DomainError::invariant(format!("job {} started before it was created", self.id)));
            }
        }
        if let Some(completed) = self.completed_at {
            let floor = self.started_at.unwrap_or(self.created_at);
            if completed < floor {
                return Err(DomainError::invariant(format!("job {} completed before it started", self.id)));
            }
        }
        Ok(())
    }

    fn ensure_transition(&self, next: JobStatus) -> DomainResult<()> {
        if self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(DomainError::invalid_transition(self.status, next))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    fn pending_job() -> Job {
        Job::new(SourceMediaId::new())
    }

    #[test]
    fn completes_through_running() {
        let mut job = pending_job();
        let now = Utc::now();

        job.mark_running(now).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.started_at, Some(now.max(job.created_at)));

        job.mark_terminal(&TerminalOutcome::Completed, now).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
        assert!(job.error_message.is_none());
        job.check_invariants().unwrap();
    }

    #[test]
    fn failure_records_message() {
        let mut job = pending_job();
        job.mark_running(Utc::now()).unwrap();
        job.mark_terminal(&TerminalOutcome::failed("audio file not found"), Utc::now())
            .unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("audio file not found"));
        job.check_invariants().unwrap();
    }

    #[test]
    fn cannot_skip_running() {
        let mut job = pending_job();
        let err = job
            .mark_terminal(&TerminalOutcome::Completed, Utc::now())
            .unwrap_err();
        assert_eq!(
            err,
            DomainError::invalid_transition(JobStatus::Pending, JobStatus::Completed)
        );
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[test]
    fn cannot_claim_twice() {
        let mut job = pending_job();
        job.mark_running(Utc::now()).unwrap();
        assert!(job.mark_running(Utc::now()).is_err());
    }

    #[test]
    fn terminal_states_are_final() {
        let mut job = pending_job();
        job.mark_running(Utc::now()).unwrap();
        job.mark_terminal(&TerminalOutcome::Completed, Utc::now()).unwrap();

        assert!(job.mark_running(Utc::now()).is_err());
        assert!(job
            .mark_terminal(&TerminalOutcome::failed("late"), Utc::now())
            .is_err());
        assert!(job.error_message.is_none());
    }

    #[test]
    fn timestamps_never_precede_creation() {
        let created = Utc::now();
        let mut job = pending_job().with_created_at(created);

        // A clock that lags behind the store must not produce a started_at before created_at.
        job.mark_running(created - Duration::seconds(30)).unwrap();
        assert_eq!(job.started_at, Some(created));

        job.mark_terminal(&TerminalOutcome::Completed, created - Duration::seconds(60))
            .unwrap();
        assert_eq!(job.completed_at, Some(created));
        job.check_invariants().unwrap();
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("cancelled".parse::<JobStatus>().is_err());
        assert_eq!("transcribe".parse::<JobKind>().unwrap(), JobKind::Transcribe);
    }

    #[derive(Debug, Clone)]
    enum Attempt {
        Run,
        Complete,
        Fail(String),
    }

    fn attempt() -> impl Strategy<Value = Attempt> {
        prop_oneof![
            Just(Attempt::Run),
            Just(Attempt::Complete),
            "[a-z ]{1,16}".prop_map(Attempt::Fail),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: whatever sequence of transitions is attempted, the statuses a job
        /// actually passes through form a prefix of pending→running→{completed|failed}.
        #[test]
        fn observed_statuses_form_a_legal_prefix(attempts in prop::collection::vec(attempt(), 0..12)) {
            let mut job = pending_job();
            let mut observed = vec![job.status];

            for a in attempts {
                let now = Utc::now();
                let applied = match a {
                    Attempt::Run => job.mark_running(now).is_ok(),
                    Attempt::Complete => job.mark_terminal(&TerminalOutcome::Completed, now).is_ok(),
                    Attempt::Fail(msg) => job.mark_terminal(&TerminalOutcome::failed(msg), now).is_ok(),
                };
                if applied {
                    observed.push(job.status);
                }
                prop_assert!(job.check_invariants().is_ok());
            }

            let success = [JobStatus::Pending, JobStatus::Running, JobStatus::Completed];
            let failure = [JobStatus::Pending, JobStatus::Running, JobStatus::Failed];
            prop_assert!(observed.len() <= 3);
            prop_assert!(success.starts_with(&observed) || failure.starts_with(&observed));
            prop_assert_eq!(job.error_message.is_some(), job.status == JobStatus::Failed);
        }
    }
}
