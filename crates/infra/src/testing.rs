//! Test doubles shared by the unit and integration tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use transcriber_core::{
    Job, JobId, SourceMedia, SourceMediaId, Segment, TerminalOutcome, TranscriptResult,
};

use crate::jobs::{ClaimOutcome, InMemoryJobStore, JobStore, JobStoreError, PendingJob};
use crate::pipeline::{EngineError, EngineOutput, EngineRequest, TranscriptionEngine};

type Script = dyn Fn(&EngineRequest) -> Result<EngineOutput, EngineError> + Send + Sync;

/// Engine whose answers come from a closure. Records every request.
pub struct ScriptedEngine {
    script: Box<Script>,
    seen: Mutex<Vec<EngineRequest>>,
}

impl ScriptedEngine {
    pub fn from_fn<F>(script: F) -> Arc<Self>
    where
        F: Fn(&EngineRequest) -> Result<EngineOutput, EngineError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            script: Box::new(script),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn always(output: EngineOutput) -> Arc<Self> {
        Self::from_fn(move |_| Ok(output.clone()))
    }

    /// Never answers within any reasonable deadline.
    pub fn hanging() -> Arc<Self> {
        Self::from_fn(|_| {
            thread::sleep(Duration::from_secs(30));
            Err(EngineError::Failed("gave up".into()))
        })
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<EngineRequest> {
        self.seen.lock().unwrap().clone()
    }
}

impl TranscriptionEngine for ScriptedEngine {
    fn transcribe(&self, request: &EngineRequest) -> Result<EngineOutput, EngineError> {
        self.seen.lock().unwrap().push(request.clone());
        (self.script)(request)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

pub fn output(text: &str, segments: Vec<Segment>, language: Option<&str>) -> EngineOutput {
    EngineOutput {
        text: text.to_string(),
        segments,
        language: language.map(str::to_string),
    }
}

pub fn hello_output() -> EngineOutput {
    output(
        "hello world",
        vec![Segment::new(0.0, 1.2, "hello world")],
        Some("en"),
    )
}

/// Register media at `location` plus a pending job for it.
pub fn seed_job(store: &InMemoryJobStore, location: &str) -> PendingJob {
    let media = SourceMedia::new(SourceMediaId::new(), location);
    let job = Job::new(media.id);
    store.insert_media(media.clone());
    store.enqueue(job.clone());
    PendingJob { job, media }
}

/// In-memory store whose operations can be made to fail on demand.
#[derive(Debug, Default)]
pub struct FlakyStore {
    pub inner: InMemoryJobStore,
    pub fail_fetch: AtomicBool,
    pub fail_claims: AtomicBool,
    pub fail_upserts: AtomicBool,
    pub fail_terminal: AtomicBool,
    pub panic_on_fetch: AtomicBool,
    /// Panics on the next upsert only.
    pub panic_on_next_upsert: AtomicBool,
    pub fetches: AtomicUsize,
}

impl FlakyStore {
    fn check(flag: &AtomicBool, operation: &'static str) -> Result<(), JobStoreError> {
        if flag.load(Ordering::SeqCst) {
            Err(JobStoreError::persistence(operation, "connection reset by peer"))
        } else {
            Ok(())
        }
    }
}

impl JobStore for FlakyStore {
    fn fetch_pending(&self, limit: usize) -> Result<Vec<PendingJob>, JobStoreError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_fetch.load(Ordering::SeqCst) {
            panic!("row decoder blew up");
        }
        Self::check(&self.fail_fetch, "fetch_pending")?;
        self.inner.fetch_pending(limit)
    }

    fn mark_running(&self, job_id: JobId) -> Result<ClaimOutcome, JobStoreError> {
        Self::check(&self.fail_claims, "mark_running")?;
        self.inner.mark_running(job_id)
    }

    fn mark_terminal(&self, job_id: JobId, outcome: &TerminalOutcome) -> Result<(), JobStoreError> {
        Self::check(&self.fail_terminal, "mark_terminal")?;
        self.inner.mark_terminal(job_id, outcome)
    }

    fn upsert_result(
        &self,
        media_id: SourceMediaId,
        result: &TranscriptResult,
    ) -> Result<(), JobStoreError> {
        if self.panic_on_next_upsert.swap(false, Ordering::SeqCst) {
            panic!("transcript encoder blew up");
        }
        Self::check(&self.fail_upserts, "upsert_result")?;
        self.inner.upsert_result(media_id, result)
    }
}
