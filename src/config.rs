//! Batching configuration.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// How long a batch accumulates requests before it is sent, unless configured otherwise.
pub const DEFAULT_SEND_AFTER: Duration = Duration::from_secs(3);

/// Controls how a [`Batcher`](crate::Batcher) groups requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "BatchingSettings")]
pub struct BatchingConfig {
    /// How long after its first request a batch is sent.
    pub send_after: Duration,
    /// When false, every request is sent on its own as soon as it is submitted.
    pub enable_batching: bool,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            send_after: DEFAULT_SEND_AFTER,
            enable_batching: true,
        }
    }
}

/// The raw `batching` settings block, as written by a user.
///
/// `send_after` uses Go-style duration syntax, e.g. `"500ms"`, `"10s"` or `"1m30s"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchingSettings {
    /// Defaults to [`DEFAULT_SEND_AFTER`] when absent or empty.
    pub send_after: Option<String>,
    /// Defaults to true.
    pub enable_batching: Option<bool>,
}

/// Invalid batching settings.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// `send_after` is not a valid duration.
    #[error("unable to parse duration from 'send_after' value {0:?}")]
    InvalidSendAfter(String),
}

impl BatchingConfig {
    /// Build a config from an optional settings block, falling back to defaults for anything
    /// missing.
    pub fn from_settings(settings: Option<&BatchingSettings>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        let Some(settings) = settings else {
            return Ok(config);
        };

        if let Some(send_after) = settings.send_after.as_deref().filter(|s| !s.is_empty()) {
            config.send_after = parse_duration(send_after)
                .ok_or_else(|| ConfigError::InvalidSendAfter(send_after.to_string()))?;
        }

        if let Some(enable_batching) = settings.enable_batching {
            config.enable_batching = enable_batching;
        }

        Ok(config)
    }
}

impl TryFrom<BatchingSettings> for BatchingConfig {
    type Error = ConfigError;

    fn try_from(settings: BatchingSettings) -> Result<Self, Self::Error> {
        Self::from_settings(Some(&settings))
    }
}

/// Parse a duration such as `"300ms"`, `"1.5h"` or `"2h45m"`.
///
/// Every number needs a unit, except a bare `"0"`. Negative durations are rejected.
fn parse_duration(input: &str) -> Option<Duration> {
    let mut rest = input.trim();
    if rest == "0" {
        return Some(Duration::ZERO);
    }
    if rest.is_empty() {
        return None;
    }

    let mut total_nanos: u128 = 0;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, after_number) = rest.split_at(number_len);

        let unit_len = after_number
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(after_number.len());
        let (unit, after_unit) = after_number.split_at(unit_len);
        let unit_nanos: u128 = match unit {
            "ns" => 1,
            "us" | "µs" | "μs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3600 * 1_000_000_000,
            _ => return None,
        };

        let (whole, frac) = number.split_once('.').unwrap_or((number, ""));
        if whole.is_empty() && frac.is_empty() {
            return None;
        }
        if frac.contains('.') {
            return None;
        }

        let whole: u128 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
        let mut nanos = whole.checked_mul(unit_nanos)?;
        if !frac.is_empty() {
            // Anything beyond nanosecond precision is dropped.
            let frac = &frac[..frac.len().min(18)];
            let frac_value: u128 = frac.parse().ok()?;
            nanos += frac_value * unit_nanos / 10u128.pow(frac.len() as u32);
        }

        total_nanos = total_nanos.checked_add(nanos)?;
        rest = after_unit;
    }

    u64::try_from(total_nanos).ok().map(Duration::from_nanos)
}
