//! Per-job transcription pipeline.
//!
//! `run` validates the input, calls the engine under a deadline and shapes
//! the engine output into a [`TranscriptResult`]. Nothing is retried here: an
//! error is final for the job.

pub mod engine;
pub mod whisper_cli;

use std::any::Any;
use std::fs::File;
use std::path::PathBuf;
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, instrument};

use transcriber_core::{
    LanguageHint, PLACEHOLDER_CONFIDENCE, TranscriptId, TranscriptResult, UNKNOWN_LANGUAGE,
};

use crate::jobs::PendingJob;

pub use engine::{EngineError, EngineOutput, EngineRequest, TranscriptionEngine};
pub use whisper_cli::WhisperCliEngine;

/// Default bound on one engine call.
pub const DEFAULT_ENGINE_TIMEOUT: Duration = Duration::from_secs(1800);

/// Extra time an engine gets past its timeout to stop its own work.
const ENGINE_STOP_GRACE: Duration = Duration::from_millis(500);

/// Pipeline failure for a single job.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    #[error("audio file not found: {}", .path.display())]
    InputNotFound { path: PathBuf },
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Runs one job's transcription against a shared engine.
#[derive(Clone)]
pub struct TranscriptionPipeline {
    engine: Arc<dyn TranscriptionEngine>,
    language: LanguageHint,
    engine_timeout: Option<Duration>,
}

impl TranscriptionPipeline {
    pub fn new(engine: Arc<dyn TranscriptionEngine>, language: LanguageHint) -> Self {
        Self {
            engine,
            language,
            engine_timeout: Some(DEFAULT_ENGINE_TIMEOUT),
        }
    }

    /// Bound each engine call; `None` waits indefinitely.
    pub fn with_engine_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.engine_timeout = timeout;
        self
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    /// Transcribe the media of `pending`.
    #[instrument(
        skip(self, pending),
        fields(job_id = %pending.job.id, media_id = %pending.media.id),
        err
    )]
    pub fn run(&self, pending: &PendingJob) -> Result<TranscriptResult, PipelineError> {
        let media = &pending.media;
        let audio_path = media.local_path();
        ensure_readable(&audio_path)?;

        let request = EngineRequest {
            audio_path,
            language: self.language.refine_with(media.language.as_ref()),
            timeout: self.engine_timeout,
        };

        let started = Instant::now();
        let output = self.call_engine(request)?;
        let processing_time = started.elapsed();
        debug!(
            engine = self.engine.name(),
            elapsed_ms = processing_time.as_millis() as u64,
            segments = output.segments.len(),
            "engine call finished"
        );

        let language = output
            .language
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| UNKNOWN_LANGUAGE.to_string());

        Ok(TranscriptResult {
            id: TranscriptId::new(),
            media_id: media.id,
            content: output.text,
            segments: output.segments,
            language,
            confidence: PLACEHOLDER_CONFIDENCE,
            processing_time,
            created_at: Utc::now(),
        })
    }

    /// Run the engine on a helper thread so a hang or a panic stays contained.
    ///
    /// The engine is expected to stop at its own timeout. One that overruns
    /// the grace period is abandoned on its helper thread.
    fn call_engine(&self, request: EngineRequest) -> Result<EngineOutput, EngineError> {
        let engine = Arc::clone(&self.engine);
        let (tx, rx) = mpsc::channel();

        thread::Builder::new()
            .name("transcription-engine".to_string())
            .spawn(move || {
                let _ = tx.send(engine.transcribe(&request));
            })
            .map_err(|e| EngineError::Failed(format!("failed to start engine thread: {e}")))?;

        match self.engine_timeout {
            Some(timeout) => match rx.recv_timeout(timeout.saturating_add(ENGINE_STOP_GRACE)) {
                Ok(result) => result,
                Err(mpsc::RecvTimeoutError::Timeout) => Err(EngineError::Timeout(timeout)),
                Err(mpsc::RecvTimeoutError::Disconnected) => Err(EngineError::Crashed),
            },
            None => rx.recv().unwrap_or(Err(EngineError::Crashed)),
        }
    }
}

impl std::fmt::Debug for TranscriptionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscriptionPipeline")
            .field("engine", &self.engine.name())
            .field("language", &self.language)
            .field("engine_timeout", &self.engine_timeout)
            .finish()
    }
}

fn ensure_readable(path: &std::path::Path) -> Result<(), PipelineError> {
    let not_found = || PipelineError::InputNotFound {
        path: path.to_path_buf(),
    };
    let file = File::open(path).map_err(|_| not_found())?;
    let metadata = file.metadata().map_err(|_| not_found())?;
    if metadata.is_file() { Ok(()) } else { Err(not_found()) }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
