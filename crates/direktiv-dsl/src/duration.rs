// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! ISO-8601 durations (`P1DT2H`, `PT0.5S`, `P2W`).
//!
//! Years count as 365 days and months as 30 days; calendar arithmetic is not
//! needed for timer scheduling.

use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;

const SECONDS_PER_MINUTE: f64 = 60.0;
const SECONDS_PER_HOUR: f64 = 3_600.0;
const SECONDS_PER_DAY: f64 = 86_400.0;

/// Error returned for malformed durations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid ISO-8601 duration '{0}'")]
pub struct DurationError(pub String);

fn pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"^P(?:(\d+(?:\.\d+)?)Y)?(?:(\d+(?:\.\d+)?)M)?(?:(\d+(?:\.\d+)?)W)?(?:(\d+(?:\.\d+)?)D)?(?:T(?:(\d+(?:\.\d+)?)H)?(?:(\d+(?:\.\d+)?)M)?(?:(\d+(?:\.\d+)?)S)?)?$",
            )
            .ok()
        })
        .as_ref()
}

/// Parse an ISO-8601 duration.
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    let trimmed = input.trim();
    let err = || DurationError(input.to_string());

    // "P" and "PT" alone match the pattern but carry no components.
    if trimmed.len() < 3 || trimmed.ends_with('T') {
        return Err(err());
    }

    let caps = pattern()
        .and_then(|re| re.captures(trimmed))
        .ok_or_else(err)?;

    let factors = [
        365.0 * SECONDS_PER_DAY,
        30.0 * SECONDS_PER_DAY,
        7.0 * SECONDS_PER_DAY,
        SECONDS_PER_DAY,
        SECONDS_PER_HOUR,
        SECONDS_PER_MINUTE,
        1.0,
    ];

    let mut seconds = 0.0_f64;
    for (i, factor) in factors.iter().enumerate() {
        if let Some(m) = caps.get(i + 1) {
            let value: f64 = m.as_str().parse().map_err(|_| err())?;
            seconds += value * factor;
        }
    }

    Duration::try_from_secs_f64(seconds).map_err(|_| err())
}

/// Returns true if `input` is a well-formed duration.
pub fn is_valid_duration(input: &str) -> bool {
    parse_duration(input).is_ok()
}
