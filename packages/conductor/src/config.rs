//! Engine configuration.
//!
//! [`ConductorConfig::default`] carries the documented defaults.
//! [`ConductorConfig::from_env`] loads `.env` and overrides them from
//! `CONDUCTOR_*` variables; a variable that is set but unparsable is an error.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

use crate::sequence::DEFAULT_TEMPO;

/// Engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ConductorConfig {
    /// A repeated request hash inside this window is a duplicate.
    pub idempotency_window: Duration,
    /// Duplicates inside this gap are flagged as rapid re-invocations.
    pub strict_mode_threshold: Duration,
    /// Hard cap on remembered request hashes.
    pub dedup_capacity: usize,
    /// Idle owner instances older than this are cleaned up.
    pub ownership_ttl: Duration,
    /// Finished executions kept in history.
    pub history_limit: usize,
    /// Tempo for sequences that do not declare one.
    pub default_tempo: u32,
    /// Extra attempts for beats with the `retry` policy.
    pub beat_retry_limit: u32,
    /// Base backoff between retry attempts, doubled each attempt.
    pub retry_backoff: Duration,
    /// Park conflicting requests instead of rejecting them.
    pub defer_on_conflict: bool,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            idempotency_window: Duration::from_millis(5000),
            strict_mode_threshold: Duration::from_millis(100),
            dedup_capacity: 1000,
            ownership_ttl: Duration::from_secs(300),
            history_limit: 100,
            default_tempo: DEFAULT_TEMPO,
            beat_retry_limit: 2,
            retry_backoff: Duration::from_millis(50),
            defer_on_conflict: false,
        }
    }
}

impl ConductorConfig {
    /// Load configuration from `CONDUCTOR_*` environment variables.
    ///
    /// Unset variables keep their defaults; set but unparsable ones are errors.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            idempotency_window: Duration::from_millis(
                parse(&lookup, "CONDUCTOR_IDEMPOTENCY_WINDOW_MS")?
                    .unwrap_or(defaults.idempotency_window.as_millis() as u64),
            ),
            strict_mode_threshold: Duration::from_millis(
                parse(&lookup, "CONDUCTOR_STRICT_MODE_THRESHOLD_MS")?
                    .unwrap_or(defaults.strict_mode_threshold.as_millis() as u64),
            ),
            dedup_capacity: parse(&lookup, "CONDUCTOR_DEDUP_CAPACITY")?
                .unwrap_or(defaults.dedup_capacity),
            ownership_ttl: Duration::from_secs(
                parse(&lookup, "CONDUCTOR_OWNERSHIP_TTL_SECS")?
                    .unwrap_or(defaults.ownership_ttl.as_secs()),
            ),
            history_limit: parse(&lookup, "CONDUCTOR_HISTORY_LIMIT")?
                .unwrap_or(defaults.history_limit),
            default_tempo: parse(&lookup, "CONDUCTOR_DEFAULT_TEMPO")?
                .unwrap_or(defaults.default_tempo),
            beat_retry_limit: parse(&lookup, "CONDUCTOR_BEAT_RETRY_LIMIT")?
                .unwrap_or(defaults.beat_retry_limit),
            retry_backoff: Duration::from_millis(
                parse(&lookup, "CONDUCTOR_RETRY_BACKOFF_MS")?
                    .unwrap_or(defaults.retry_backoff.as_millis() as u64),
            ),
            defer_on_conflict: parse(&lookup, "CONDUCTOR_DEFER_ON_CONFLICT")?
                .unwrap_or(defaults.defer_on_conflict),
        })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{key} must be a valid value, got '{raw}'")),
        _ => Ok(None),
    }
}
