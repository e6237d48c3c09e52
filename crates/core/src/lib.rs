//! `transcriber-core`: domain model of the transcription worker.
//!
//! This crate contains **pure domain** types (no storage or engine concerns):
//! typed identifiers, the job lifecycle, source media and transcripts.

pub mod error;
pub mod id;
pub mod job;
pub mod media;
pub mod transcript;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, SourceMediaId, TranscriptId};
pub use job::{Job, JobKind, JobStatus, TerminalOutcome};
pub use media::{LanguageHint, SourceMedia};
pub use transcript::{PLACEHOLDER_CONFIDENCE, Segment, TranscriptResult, UNKNOWN_LANGUAGE};
