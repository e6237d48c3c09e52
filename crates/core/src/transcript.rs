//! Persisted transcription output.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{SourceMediaId, TranscriptId};

/// Confidence stored with every transcript.
///
/// The worker does not compute a real confidence score; this is a known
/// limitation, kept as a constant until an engine reports one.
pub const PLACEHOLDER_CONFIDENCE: f64 = 0.95;

/// Language recorded when the engine does not report one.
pub const UNKNOWN_LANGUAGE: &str = "unknown";

/// A timed span of transcribed text, as emitted by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Start offset in seconds
    pub start: f64,
    /// End offset in seconds
    pub end: f64,
    pub text: String,
}

impl Segment {
    pub fn new(start: f64, end: f64, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
        }
    }
}

/// The transcript of one source media asset.
///
/// At most one exists per media; a newer result replaces the older one's
/// fields in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptResult {
    pub id: TranscriptId,
    pub media_id: SourceMediaId,
    /// Full transcript text
    pub content: String,
    /// Engine segments, in engine order
    pub segments: Vec<Segment>,
    /// Detected or requested language
    pub language: String,
    pub confidence: f64,
    /// Wall-clock time spent in the engine call
    pub processing_time: Duration,
    pub created_at: DateTime<Utc>,
}

impl TranscriptResult {
    /// Processing time as persisted (whole seconds, rounded down).
    pub fn processing_time_seconds(&self) -> i32 {
        i32::try_from(self.processing_time.as_secs()).unwrap_or(i32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processing_time_truncates_to_seconds() {
        let result = TranscriptResult {
            id: TranscriptId::new(),
            media_id: SourceMediaId::new(),
            content: "hello".into(),
            segments: vec![Segment::new(0.0, 1.0, "hello")],
            language: "en".into(),
            confidence: PLACEHOLDER_CONFIDENCE,
            processing_time: Duration::from_millis(2_900),
            created_at: Utc::now(),
        };
        assert_eq!(result.processing_time_seconds(), 2);
    }

    #[test]
    fn segments_serialize_in_order() {
        let segments = vec![
            Segment::new(0.0, 1.2, "hello world"),
            Segment::new(1.2, 2.0, "again"),
        ];
        let json = serde_json::to_value(&segments).unwrap();
        assert_eq!(json[0]["text"], "hello world");
        assert_eq!(json[1]["start"], 1.2);
    }
}
