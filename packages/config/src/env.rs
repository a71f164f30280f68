// ABOUTME: Environment variable parsing utilities
// ABOUTME: Typed lookups with defaults, range validation and millisecond durations

use std::str::FromStr;
use std::time::Duration;

/// Look up `name` and parse it. Unset or blank variables yield `None`; a value that fails to
/// parse or falls outside `accept` logs a warning and also yields `None`.
fn lookup<T, F>(name: &str, accept: F) -> Option<T>
where
    T: FromStr,
    F: Fn(&T) -> bool,
{
    let raw = std::env::var(name).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    match trimmed.parse::<T>() {
        Ok(value) if accept(&value) => Some(value),
        Ok(_) => {
            tracing::warn!(variable = name, value = trimmed, "Value rejected, using default");
            None
        }
        Err(_) => {
            tracing::warn!(variable = name, value = trimmed, "Unparseable value, using default");
            None
        }
    }
}

/// Parse an environment variable, falling back to `default` when unset or invalid.
pub fn env_or<T: FromStr>(name: &str, default: T) -> T {
    lookup(name, |_| true).unwrap_or(default)
}

/// Parse an environment variable that must satisfy `accept`.
pub fn env_validated<T, F>(name: &str, default: T, accept: F) -> T
where
    T: FromStr,
    F: Fn(&T) -> bool,
{
    lookup(name, accept).unwrap_or(default)
}

/// Read a millisecond count as a [`Duration`]. Values below `min_ms` are rejected.
pub fn env_millis(name: &str, default_ms: u64, min_ms: u64) -> Duration {
    Duration::from_millis(env_validated(name, default_ms, |v| *v >= min_ms))
}

/// Read a string, trying `primary` then `fallback` before using `default`.
pub fn env_string_with_fallback(primary: &str, fallback: &str, default: &str) -> String {
    lookup::<String, _>(primary, |_| true)
        .or_else(|| lookup::<String, _>(fallback, |_| true))
        .unwrap_or_else(|| default.to_string())
}

/// Read an optional string; blank values count as unset.
pub fn env_optional(name: &str) -> Option<String> {
    lookup::<String, _>(name, |_| true)
}
