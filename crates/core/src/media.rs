//! Source media (the audio a job points at) and language hints.

use core::fmt;
use core::str::FromStr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::SourceMediaId;

/// Language hint handed to the transcription engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LanguageHint {
    /// Let the engine detect the spoken language.
    Auto,
    /// An explicit language code, e.g. `en` or `de`.
    Code(String),
}

impl LanguageHint {
    /// The code to pass to an engine, or `None` for auto-detection.
    pub fn code(&self) -> Option<&str> {
        match self {
            LanguageHint::Auto => None,
            LanguageHint::Code(code) => Some(code),
        }
    }

    pub fn is_auto(&self) -> bool {
        matches!(self, LanguageHint::Auto)
    }

    /// Prefer `self`, but let a media-level hint refine auto-detection.
    pub fn refine_with(&self, media_hint: Option<&LanguageHint>) -> LanguageHint {
        match (self, media_hint) {
            (LanguageHint::Auto, Some(hint)) => hint.clone(),
            _ => self.clone(),
        }
    }
}

impl Default for LanguageHint {
    fn default() -> Self {
        Self::Auto
    }
}

impl fmt::Display for LanguageHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LanguageHint::Auto => f.write_str("auto"),
            LanguageHint::Code(code) => f.write_str(code),
        }
    }
}

impl FromStr for LanguageHint {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("auto") {
            return Ok(LanguageHint::Auto);
        }
        if !trimmed.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(DomainError::validation(format!("invalid language code: {trimmed}")));
        }
        Ok(LanguageHint::Code(trimmed.to_ascii_lowercase()))
    }
}

/// The audio asset a job refers to. Read-only for the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMedia {
    pub id: SourceMediaId,
    /// Path or `file://` URI of the raw audio
    pub location: String,
    /// Language recorded for the asset, if any
    pub language: Option<LanguageHint>,
}

impl SourceMedia {
    pub fn new(id: SourceMediaId, location: impl Into<String>) -> Self {
        Self {
            id,
            location: location.into(),
            language: None,
        }
    }

    pub fn with_language(mut self, language: LanguageHint) -> Self {
        self.language = Some(language);
        self
    }

    /// Local filesystem path of the audio, with a `file://` scheme stripped.
    pub fn local_path(&self) -> PathBuf {
        let location = self.location.trim();
        PathBuf::from(location.strip_prefix("file://").unwrap_or(location))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_sentinel_parses_case_insensitively() {
        assert_eq!("auto".parse::<LanguageHint>().unwrap(), LanguageHint::Auto);
        assert_eq!("AUTO".parse::<LanguageHint>().unwrap(), LanguageHint::Auto);
        assert_eq!("".parse::<LanguageHint>().unwrap(), LanguageHint::Auto);
        assert_eq!(
            "EN".parse::<LanguageHint>().unwrap(),
            LanguageHint::Code("en".to_string())
        );
        assert!("en; drop".parse::<LanguageHint>().is_err());
    }

    #[test]
    fn media_hint_only_refines_auto() {
        let german = LanguageHint::Code("de".into());
        let english = LanguageHint::Code("en".into());

        assert_eq!(LanguageHint::Auto.refine_with(Some(&german)), german);
        assert_eq!(english.refine_with(Some(&german)), english);
        assert_eq!(LanguageHint::Auto.refine_with(None), LanguageHint::Auto);
    }

    #[test]
    fn file_uri_is_stripped() {
        let media = SourceMedia::new(SourceMediaId::new(), "file:///data/books/ch1.mp3");
        assert_eq!(media.local_path(), PathBuf::from("/data/books/ch1.mp3"));

        let media = SourceMedia::new(SourceMediaId::new(), "/data/books/ch2.mp3");
        assert_eq!(media.local_path(), PathBuf::from("/data/books/ch2.mp3"));
    }
}
