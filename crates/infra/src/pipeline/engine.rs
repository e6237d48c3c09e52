//! Speech-to-text engine boundary.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use transcriber_core::{LanguageHint, Segment};

/// Request to transcribe one audio file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineRequest {
    /// Local path of the audio
    pub audio_path: PathBuf,
    /// `Auto` asks the engine to detect the language.
    pub language: LanguageHint,
    /// Time budget for the call; `None` is unbounded.
    pub timeout: Option<Duration>,
}

/// Raw engine output, before it is shaped into a transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineOutput {
    pub text: String,
    /// Engine-native segments, in order
    #[serde(default)]
    pub segments: Vec<Segment>,
    /// Detected language, when the engine reports it
    #[serde(default)]
    pub language: Option<String>,
}

/// Engine failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("transcription failed: {0}")]
    Failed(String),
    #[error("engine returned unreadable output: {0}")]
    InvalidOutput(String),
    #[error("transcription timed out after {0:?}")]
    Timeout(Duration),
    #[error("transcription engine crashed")]
    Crashed,
}

/// Trait for pluggable transcription engines.
///
/// Implementations block until the transcript is ready. They are shared
/// across calls and must not hold per-job state. Engines that start external
/// work stop it once `request.timeout` has elapsed and return
/// [`EngineError::Timeout`].
pub trait TranscriptionEngine: Send + Sync + 'static {
    /// Transcribe a complete audio file.
    fn transcribe(&self, request: &EngineRequest) -> Result<EngineOutput, EngineError>;

    /// Human-readable engine name.
    fn name(&self) -> &str;
}
