//! Worker configuration from environment variables.

use std::time::Duration;

use transcriber_core::LanguageHint;

use crate::jobs::{PollPolicy, WorkerLoopConfig};

pub const DEFAULT_REDIS_URL: &str = "redis://redis:6379/0";
pub const DEFAULT_WHISPER_MODEL: &str = "tiny";
pub const DEFAULT_WHISPER_BIN: &str = "whisper";
pub const DEFAULT_WORKER_NAME: &str = "transcriber";
pub const DEFAULT_ENGINE_TIMEOUT_SECS: u64 = 1800;

/// Configuration error; fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has an invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Everything the worker binary needs to start.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    pub database_url: String,
    pub redis_url: String,
    pub whisper_model: String,
    pub whisper_language: LanguageHint,
    /// Command line used to start whisper
    pub whisper_bin: String,
    /// `None` waits for the engine indefinitely
    pub engine_timeout: Option<Duration>,
    pub worker_name: String,
    pub poll: PollPolicy,
}

impl WorkerSettings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read settings through `lookup`; unset and blank values take defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let or_default = |name: &str, default: &str| get(name).unwrap_or_else(|| default.to_string());

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let whisper_language = match get("WHISPER_LANGUAGE") {
            Some(raw) => raw.parse::<LanguageHint>().map_err(|e| ConfigError::Invalid {
                name: "WHISPER_LANGUAGE",
                value: raw.clone(),
                reason: e.to_string(),
            })?,
            None => LanguageHint::Auto,
        };

        let defaults = PollPolicy::default();
        let batch_size = parse_number(&get, "WORKER_BATCH_SIZE", defaults.batch_size as u64)?;
        if batch_size == 0 {
            return Err(ConfigError::Invalid {
                name: "WORKER_BATCH_SIZE",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        let batch_size = usize::try_from(batch_size).map_err(|e| ConfigError::Invalid {
            name: "WORKER_BATCH_SIZE",
            value: batch_size.to_string(),
            reason: e.to_string(),
        })?;

        let poll = PollPolicy {
            batch_size,
            idle_delay: parse_secs(&get, "WORKER_IDLE_DELAY_SECS", defaults.idle_delay)?,
            iteration_delay: parse_secs(&get, "WORKER_ITERATION_DELAY_SECS", defaults.iteration_delay)?,
            error_backoff: parse_secs(&get, "WORKER_ERROR_BACKOFF_SECS", defaults.error_backoff)?,
        };

        let engine_timeout = match parse_number(&get, "ENGINE_TIMEOUT_SECS", DEFAULT_ENGINE_TIMEOUT_SECS)? {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Ok(Self {
            database_url,
            redis_url: or_default("REDIS_URL", DEFAULT_REDIS_URL),
            whisper_model: or_default("WHISPER_MODEL", DEFAULT_WHISPER_MODEL),
            whisper_language,
            whisper_bin: or_default("WHISPER_BIN", DEFAULT_WHISPER_BIN),
            engine_timeout,
            worker_name: or_default("WORKER_NAME", DEFAULT_WORKER_NAME),
            poll,
        })
    }

    pub fn loop_config(&self) -> WorkerLoopConfig {
        WorkerLoopConfig::default()
            .with_name(self.worker_name.clone())
            .with_policy(self.poll)
    }

    /// `DATABASE_URL` with the password masked, for logging.
    pub fn redacted_database_url(&self) -> String {
        redact_url(&self.database_url)
    }
}

fn parse_number<G>(get: &G, name: &'static str, default: u64) -> Result<u64, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(raw) => raw.parse::<u64>().map_err(|e| ConfigError::Invalid {
            name,
            value: raw,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn parse_secs<G>(get: &G, name: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    parse_number(get, name, default.as_secs()).map(Duration::from_secs)
}

fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let Some((userinfo, host)) = rest.rsplit_once('@') else {
        return url.to_string();
    };
    match userinfo.split_once(':') {
        Some((user, _)) => format!("{scheme}://{user}:***@{host}"),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn settings(vars: &[(&str, &str)]) -> Result<WorkerSettings, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerSettings::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_only_database_is_set() {
        let s = settings(&[("DATABASE_URL", "postgres://app:secret@db/audiobooks")]).unwrap();

        assert_eq!(s.redis_url, DEFAULT_REDIS_URL);
        assert_eq!(s.whisper_model, "tiny");
        assert_eq!(s.whisper_language, LanguageHint::Auto);
        assert_eq!(s.whisper_bin, "whisper");
        assert_eq!(s.engine_timeout, Some(Duration::from_secs(1800)));
        assert_eq!(s.worker_name, "transcriber");
        assert_eq!(s.poll, PollPolicy::default());
    }

    #[test]
    fn database_url_is_required() {
        assert_eq!(settings(&[]).unwrap_err(), ConfigError::Missing("DATABASE_URL"));
        assert_eq!(
            settings(&[("DATABASE_URL", "   ")]).unwrap_err(),
            ConfigError::Missing("DATABASE_URL")
        );
    }

    #[test]
    fn overrides_are_read() {
        let s = settings(&[
            ("DATABASE_URL", "postgres://db/x"),
            ("REDIS_URL", "redis://cache:6380/1"),
            ("WHISPER_MODEL", "medium"),
            ("WHISPER_LANGUAGE", "DE"),
            ("WHISPER_BIN", "python3 -m whisper"),
            ("WORKER_BATCH_SIZE", "2"),
            ("WORKER_IDLE_DELAY_SECS", "1"),
            ("WORKER_ITERATION_DELAY_SECS", "0"),
            ("WORKER_ERROR_BACKOFF_SECS", "7"),
            ("ENGINE_TIMEOUT_SECS", "0"),
            ("WORKER_NAME", "transcriber-2"),
        ])
        .unwrap();

        assert_eq!(s.redis_url, "redis://cache:6380/1");
        assert_eq!(s.whisper_model, "medium");
        assert_eq!(s.whisper_language, LanguageHint::Code("de".into()));
        assert_eq!(s.whisper_bin, "python3 -m whisper");
        assert_eq!(
            s.poll,
            PollPolicy {
                batch_size: 2,
                idle_delay: Duration::from_secs(1),
                iteration_delay: Duration::ZERO,
                error_backoff: Duration::from_secs(7),
            }
        );
        assert_eq!(s.engine_timeout, None);

        let config = s.loop_config();
        assert_eq!(config.name, "transcriber-2");
        assert_eq!(config.policy.batch_size, 2);
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let err = settings(&[("DATABASE_URL", "postgres://db/x"), ("WORKER_IDLE_DELAY_SECS", "ten")])
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "WORKER_IDLE_DELAY_SECS", .. }));

        let err = settings(&[("DATABASE_URL", "postgres://db/x"), ("ENGINE_TIMEOUT_SECS", "-1")])
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "ENGINE_TIMEOUT_SECS", .. }));
    }

    #[test]
    fn batch_size_must_be_positive() {
        let err = settings(&[("DATABASE_URL", "postgres://db/x"), ("WORKER_BATCH_SIZE", "0")])
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "WORKER_BATCH_SIZE", .. }));
    }

    #[test]
    fn bad_language_code_is_rejected() {
        let err = settings(&[("DATABASE_URL", "postgres://db/x"), ("WHISPER_LANGUAGE", "en us")])
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "WHISPER_LANGUAGE", .. }));
    }

    #[test]
    fn database_password_is_redacted() {
        assert_eq!(
            redact_url("postgres://app:s3cret@db:5432/audiobooks"),
            "postgres://app:***@db:5432/audiobooks"
        );
        assert_eq!(redact_url("postgres://db/audiobooks"), "postgres://db/audiobooks");
        assert_eq!(redact_url("not a url"), "not a url");
    }
}
