// Copyright © 2026 The Fanout Contributors
//
// This file is part of fanout, distributed under the GPLv3 or later.

//! Human-readable duration strings.
//!
//! The accepted grammar is a concatenation of one or more `<number><unit>`
//! terms, with unit one of `ns`, `us`, `µs`, `ms`, `s`, `m`, `h` and
//! fractional numbers allowed, e.g. `"300ms"`, `"1.5s"`, `"1h30m"`. A bare
//! numeric value is interpreted as floating-point seconds.

use std::{str::FromStr, time::Duration};

#[derive(Debug, thiserror::Error)]
pub enum ParseDurationError {
    #[error("empty duration")]
    Empty,

    #[error("invalid duration `{0}`")]
    Syntax(String),

    #[error("unknown unit in duration `{0}`")]
    Unit(String),

    #[error("duration out of range `{0}`")]
    Range(String),
}

/// Parse a duration string.
pub fn parse_duration(input: &str) -> Result<Duration, ParseDurationError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(ParseDurationError::Empty);
    }

    if let Ok(seconds) = s.parse::<f64>() {
        return seconds_to_duration(input, seconds);
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let split = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        if split == 0 {
            return Err(ParseDurationError::Syntax(input.to_owned()));
        }
        let (number, tail) = rest.split_at(split);
        let value = number
            .parse::<f64>()
            .map_err(|_| ParseDurationError::Syntax(input.to_owned()))?;
        let (unit_seconds, remainder) =
            take_unit(tail).ok_or_else(|| ParseDurationError::Unit(input.to_owned()))?;
        let term = Duration::try_from_secs_f64(value * unit_seconds)
            .map_err(|_| ParseDurationError::Range(input.to_owned()))?;
        total = total
            .checked_add(term)
            .ok_or_else(|| ParseDurationError::Range(input.to_owned()))?;
        rest = remainder;
    }
    Ok(total)
}

// Longer units first so "ms" is not read as "m".
fn take_unit(s: &str) -> Option<(f64, &str)> {
    const UNITS: [(&str, f64); 7] = [
        ("ns", 1e-9),
        ("us", 1e-6),
        ("µs", 1e-6),
        ("ms", 1e-3),
        ("s", 1.0),
        ("m", 60.0),
        ("h", 3600.0),
    ];
    UNITS
        .iter()
        .find_map(|(name, seconds)| s.strip_prefix(name).map(|rest| (*seconds, rest)))
}

fn seconds_to_duration(input: &str, seconds: f64) -> Result<Duration, ParseDurationError> {
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(ParseDurationError::Range(input.to_owned()));
    }
    Duration::try_from_secs_f64(seconds).map_err(|_| ParseDurationError::Range(input.to_owned()))
}

/// A [`Duration`] that parses from the human-readable grammar, for use in
/// configuration values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HumanDuration(Duration);

impl From<HumanDuration> for Duration {
    fn from(d: HumanDuration) -> Self {
        d.0
    }
}

impl From<Duration> for HumanDuration {
    fn from(d: Duration) -> Self {
        Self(d)
    }
}

impl FromStr for HumanDuration {
    type Err = ParseDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_duration(s).map(Self)
    }
}
