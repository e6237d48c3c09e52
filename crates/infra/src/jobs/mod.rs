//! Transcription job processing.
//!
//! ## Components
//!
//! - `JobStore`: access to pending jobs, status writes and transcripts
//!   (in-memory or Postgres)
//! - `lifecycle`: the claim guard that orders status writes
//! - `WorkerLoop`: polls the store and drives each job through the pipeline

pub mod lifecycle;
pub mod postgres;
pub mod store;
pub mod worker;

pub use lifecycle::{RunningJob, claim};
pub use postgres::PostgresJobStore;
pub use store::{ClaimOutcome, InMemoryJobStore, JobStore, JobStoreError, PendingJob};
pub use worker::{
    BatchReport, IterationOutcome, JobDisposition, LoopError, PollPolicy, WorkerHandle,
    WorkerLoop, WorkerLoopConfig, WorkerStats,
};
