//! Timeout strings as accepted on the command line and in requests.
//!
//! Accepts a sequence of `<number><unit>` groups (`ms`, `s`, `m`, `h`),
//! e.g. `500ms`, `10s`, `1m30s`. A bare number means seconds.

use std::time::Duration;
use tracing::warn;

/// Bound applied when a request carries no usable timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

pub fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if let Ok(secs) = input.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let value: u64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let part = match unit {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.checked_mul(60)?),
            "h" => Duration::from_secs(value.checked_mul(3600)?),
            _ => return None,
        };
        total = total.checked_add(part)?;
    }
    Some(total)
}

/// Resolve an optional timeout string, falling back to `default` when it is
/// absent or unparseable.
pub fn effective_timeout(raw: Option<&str>, default: Duration) -> Duration {
    match raw {
        None => default,
        Some(s) => match parse_duration(s) {
            Some(d) if !d.is_zero() => d,
            _ => {
                warn!(timeout = s, ?default, "Unparseable timeout, using default");
                default
            }
        },
    }
}
