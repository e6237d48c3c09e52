//! The polling worker loop.
//!
//! Each iteration fetches a batch of pending jobs and handles them one after
//! another: claim, transcribe, store the transcript, record the outcome. A
//! failing or panicking job never aborts the batch; a failing poll only
//! lengthens the wait.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use transcriber_core::TranscriptResult;

use super::lifecycle;
use super::store::{JobStore, JobStoreError, PendingJob};
use crate::pipeline::{TranscriptionPipeline, panic_message};

/// Batch size and wait intervals of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Maximum jobs fetched per iteration (at least 1)
    pub batch_size: usize,
    /// Extra wait when a poll found nothing
    pub idle_delay: Duration,
    /// Wait after every iteration
    pub iteration_delay: Duration,
    /// Extra wait after a loop-level error
    pub error_backoff: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            batch_size: 5,
            idle_delay: Duration::from_secs(10),
            iteration_delay: Duration::from_secs(5),
            error_backoff: Duration::from_secs(30),
        }
    }
}

impl PollPolicy {
    /// How long to wait before the next iteration.
    pub fn delay_after(&self, outcome: &IterationOutcome) -> Duration {
        let extra = match outcome {
            IterationOutcome::Idle => self.idle_delay,
            IterationOutcome::Processed(_) => Duration::ZERO,
            IterationOutcome::Failed(_) => self.error_backoff,
        };
        extra.saturating_add(self.iteration_delay)
    }
}

/// Error that escaped an iteration body.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoopError {
    #[error("failed to fetch pending jobs: {0}")]
    Poll(#[source] JobStoreError),
    #[error("worker iteration panicked: {0}")]
    Panicked(String),
}

/// What happened to a single job of a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum JobDisposition {
    /// Transcript stored and the job marked completed.
    Completed,
    /// The job was marked failed with `error`.
    Failed { error: String },
    /// Another worker claimed the job first.
    ClaimLost,
    /// The claim write itself failed; the job stays pending.
    ClaimFailed { error: String },
}

/// Per-iteration tally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub fetched: usize,
    pub completed: usize,
    pub failed: usize,
    /// Jobs left untouched because they could not be claimed
    pub skipped: usize,
}

impl BatchReport {
    fn record(&mut self, disposition: &JobDisposition) {
        match disposition {
            JobDisposition::Completed => self.completed += 1,
            JobDisposition::Failed { .. } => self.failed += 1,
            JobDisposition::ClaimLost | JobDisposition::ClaimFailed { .. } => self.skipped += 1,
        }
    }
}

/// Result of one loop iteration.
#[derive(Debug, Clone)]
pub enum IterationOutcome {
    /// No pending jobs were found.
    Idle,
    /// A non-empty batch was handled.
    Processed(BatchReport),
    /// The iteration body failed before or while handling the batch.
    Failed(LoopError),
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub iterations: u64,
    pub idle_iterations: u64,
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub claims_lost: u64,
    pub claim_errors: u64,
    pub loop_errors: u64,
    pub uptime_secs: u64,
}

/// Worker loop configuration.
#[derive(Debug, Clone)]
pub struct WorkerLoopConfig {
    /// Name for logging and the worker thread
    pub name: String,
    pub policy: PollPolicy,
}

impl Default for WorkerLoopConfig {
    fn default() -> Self {
        Self {
            name: "transcriber".to_string(),
            policy: PollPolicy::default(),
        }
    }
}

impl WorkerLoopConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Handle to control a spawned worker loop.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Stop once the current batch is finished and wait for the thread to exit.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    pub fn stats(&self) -> WorkerStats {
        lock(&self.stats).clone()
    }
}

/// Sequential transcription worker.
///
/// Owns the store and the pipeline for its whole life; only one job is in
/// flight at a time.
pub struct WorkerLoop<S: JobStore> {
    store: S,
    pipeline: TranscriptionPipeline,
    config: WorkerLoopConfig,
    stats: Arc<Mutex<WorkerStats>>,
}

impl<S: JobStore> WorkerLoop<S> {
    pub fn new(store: S, pipeline: TranscriptionPipeline, config: WorkerLoopConfig) -> Self {
        Self {
            store,
            pipeline,
            config,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    pub fn config(&self) -> &WorkerLoopConfig {
        &self.config
    }

    pub fn stats(&self) -> WorkerStats {
        lock(&self.stats).clone()
    }

    /// Poll the store forever on the current thread.
    pub fn run(self) {
        self.drive(None);
    }

    /// Run the loop on a named background thread.
    pub fn spawn(self) -> io::Result<WorkerHandle>
    where
        S: 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::clone(&self.stats);

        let join = thread::Builder::new()
            .name(self.config.name.clone())
            .spawn(move || self.drive(Some(&shutdown_rx)))?;

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }

    /// One poll plus the handling of its batch.
    ///
    /// Never panics and never returns an error: everything that goes wrong is
    /// folded into the outcome.
    pub fn run_iteration(&self) -> IterationOutcome {
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| self.poll_and_process())) {
            Ok(Ok(Some(report))) => IterationOutcome::Processed(report),
            Ok(Ok(None)) => IterationOutcome::Idle,
            Ok(Err(e)) => IterationOutcome::Failed(e),
            Err(payload) => {
                IterationOutcome::Failed(LoopError::Panicked(panic_message(payload.as_ref())))
            }
        };

        let mut stats = lock(&self.stats);
        stats.iterations += 1;
        match &outcome {
            IterationOutcome::Idle => stats.idle_iterations += 1,
            IterationOutcome::Processed(_) => {}
            IterationOutcome::Failed(e) => {
                stats.loop_errors += 1;
                error!(worker = %self.config.name, error = %e, "worker iteration failed");
            }
        }
        outcome
    }

    /// Handle every job of a batch in order.
    pub fn process_batch(&self, batch: &[PendingJob]) -> BatchReport {
        let mut report = BatchReport {
            fetched: batch.len(),
            ..BatchReport::default()
        };
        for pending in batch {
            let disposition = panic::catch_unwind(AssertUnwindSafe(|| self.handle_job(pending)))
                .unwrap_or_else(|payload| {
                    // Panicked while claiming or finishing; the job row is left as it is.
                    let error = format!("job handling panicked: {}", panic_message(payload.as_ref()));
                    error!(worker = %self.config.name, job_id = %pending.job.id, error = %error, "job status write panicked");
                    lock(&self.stats).jobs_failed += 1;
                    JobDisposition::Failed { error }
                });
            report.record(&disposition);
        }
        report
    }

    /// Claim, transcribe and finish one job.
    pub fn handle_job(&self, pending: &PendingJob) -> JobDisposition {
        let job_id = pending.job.id;
        let media_id = pending.media.id;

        let running = match lifecycle::claim(&self.store, job_id) {
            Ok(Some(running)) => running,
            Ok(None) => {
                debug!(worker = %self.config.name, job_id = %job_id, "job already claimed, skipping");
                lock(&self.stats).claims_lost += 1;
                return JobDisposition::ClaimLost;
            }
            Err(e) => {
                warn!(worker = %self.config.name, job_id = %job_id, error = %e, "failed to claim job");
                lock(&self.stats).claim_errors += 1;
                return JobDisposition::ClaimFailed {
                    error: e.to_string(),
                };
            }
        };
        debug!(worker = %self.config.name, job_id = %job_id, media_id = %media_id, "claimed job");
        lock(&self.stats).jobs_processed += 1;

        let stored = panic::catch_unwind(AssertUnwindSafe(|| self.transcribe_and_store(pending)))
            .unwrap_or_else(|payload| {
                Err(format!("job handling panicked: {}", panic_message(payload.as_ref())))
            });

        match stored {
            Ok(result) => {
                if let Err(e) = running.complete() {
                    warn!(job_id = %job_id, error = %e, "transcript stored but job not marked completed");
                }
                lock(&self.stats).jobs_succeeded += 1;
                info!(
                    worker = %self.config.name,
                    job_id = %job_id,
                    media_id = %media_id,
                    language = %result.language,
                    processing_time_seconds = result.processing_time_seconds(),
                    "job completed"
                );
                JobDisposition::Completed
            }
            Err(error) => {
                if let Err(e) = running.fail(error.clone()) {
                    warn!(job_id = %job_id, error = %e, "failed to record job failure");
                }
                lock(&self.stats).jobs_failed += 1;
                warn!(worker = %self.config.name, job_id = %job_id, media_id = %media_id, error = %error, "job failed");
                JobDisposition::Failed { error }
            }
        }
    }

    fn transcribe_and_store(&self, pending: &PendingJob) -> Result<TranscriptResult, String> {
        let result = self.pipeline.run(pending).map_err(|e| e.to_string())?;
        self.store
            .upsert_result(pending.media.id, &result)
            .map_err(|e| format!("failed to save transcript: {e}"))?;
        Ok(result)
    }

    fn poll_and_process(&self) -> Result<Option<BatchReport>, LoopError> {
        let batch = self
            .store
            .fetch_pending(self.config.policy.batch_size)
            .map_err(LoopError::Poll)?;
        if batch.is_empty() {
            return Ok(None);
        }
        debug!(worker = %self.config.name, jobs = batch.len(), "fetched pending jobs");
        Ok(Some(self.process_batch(&batch)))
    }

    fn drive(&self, shutdown: Option<&mpsc::Receiver<()>>) {
        info!(
            worker = %self.config.name,
            engine = self.pipeline.engine_name(),
            batch_size = self.config.policy.batch_size,
            "transcription worker started"
        );
        let started = Instant::now();

        loop {
            if shutdown.is_some_and(|rx| rx.try_recv().is_ok()) {
                break;
            }

            let outcome = self.run_iteration();
            lock(&self.stats).uptime_secs = started.elapsed().as_secs();

            if let IterationOutcome::Processed(report) = &outcome {
                info!(
                    worker = %self.config.name,
                    fetched = report.fetched,
                    completed = report.completed,
                    failed = report.failed,
                    skipped = report.skipped,
                    "batch finished"
                );
            }

            if wait(shutdown, self.config.policy.delay_after(&outcome)) {
                break;
            }
        }

        info!(worker = %self.config.name, "transcription worker stopped");
    }
}

/// Sleep for `delay`, waking early on shutdown. Returns `true` to stop.
fn wait(shutdown: Option<&mpsc::Receiver<()>>, delay: Duration) -> bool {
    match shutdown {
        Some(rx) => match rx.recv_timeout(delay) {
            Ok(()) => true,
            Err(mpsc::RecvTimeoutError::Timeout) => false,
            // Handle dropped without a shutdown: keep running detached.
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                thread::sleep(delay);
                false
            }
        },
        None => {
            thread::sleep(delay);
            false
        }
    }
}

fn lock(stats: &Mutex<WorkerStats>) -> MutexGuard<'_, WorkerStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use transcriber_core::{JobStatus, LanguageHint};

    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use crate::testing::{ScriptedEngine, hello_output, seed_job};

    fn worker(store: Arc<InMemoryJobStore>, engine: Arc<ScriptedEngine>) -> WorkerLoop<Arc<InMemoryJobStore>> {
        let pipeline = TranscriptionPipeline::new(engine, LanguageHint::Auto);
        WorkerLoop::new(store, pipeline, WorkerLoopConfig::default().with_name("test-worker"))
    }

    #[test]
    fn default_policy_matches_production_intervals() {
        let policy = PollPolicy::default();
        assert_eq!(policy.batch_size, 5);
        assert_eq!(policy.delay_after(&IterationOutcome::Idle), Duration::from_secs(15));
        assert_eq!(
            policy.delay_after(&IterationOutcome::Processed(BatchReport::default())),
            Duration::from_secs(5)
        );
        assert_eq!(
            policy.delay_after(&IterationOutcome::Failed(LoopError::Panicked("boom".into()))),
            Duration::from_secs(35)
        );
    }

    #[test]
    fn handle_job_completes_and_counts() {
        let store = InMemoryJobStore::arc();
        let audio = tempfile::NamedTempFile::new().unwrap();
        let pending = seed_job(&store, audio.path().to_str().unwrap());
        let engine = ScriptedEngine::always(hello_output());
        let worker = worker(store.clone(), engine);

        assert_eq!(worker.handle_job(&pending), JobDisposition::Completed);

        assert_eq!(store.job(pending.job.id).unwrap().status, JobStatus::Completed);
        assert!(store.result_for(pending.media.id).is_some());
        let stats = worker.stats();
        assert_eq!(stats.jobs_processed, 1);
        assert_eq!(stats.jobs_succeeded, 1);
    }

    #[test]
    fn lost_claim_skips_the_job() {
        let store = InMemoryJobStore::arc();
        let audio = tempfile::NamedTempFile::new().unwrap();
        let pending = seed_job(&store, audio.path().to_str().unwrap());
        let engine = ScriptedEngine::always(hello_output());
        let worker = worker(store.clone(), engine.clone());

        store.mark_running(pending.job.id).unwrap();

        assert_eq!(worker.handle_job(&pending), JobDisposition::ClaimLost);
        assert_eq!(engine.calls(), 0);
        assert_eq!(store.job(pending.job.id).unwrap().status, JobStatus::Running);
        assert_eq!(worker.stats().claims_lost, 1);
    }

    #[test]
    fn failed_batch_entries_are_tallied() {
        let store = InMemoryJobStore::arc();
        let audio = tempfile::NamedTempFile::new().unwrap();
        let good = seed_job(&store, audio.path().to_str().unwrap());
        let missing = seed_job(&store, "/no/such/audio.wav");
        let worker = worker(store.clone(), ScriptedEngine::always(hello_output()));

        let report = worker.process_batch(&[missing, good]);

        assert_eq!(
            report,
            BatchReport {
                fetched: 2,
                completed: 1,
                failed: 1,
                skipped: 0
            }
        );
    }

    #[test]
    fn idle_iteration_is_counted() {
        let store = InMemoryJobStore::arc();
        let worker = worker(store, ScriptedEngine::always(hello_output()));

        assert!(matches!(worker.run_iteration(), IterationOutcome::Idle));
        let stats = worker.stats();
        assert_eq!(stats.iterations, 1);
        assert_eq!(stats.idle_iterations, 1);
    }
}
