// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Small helpers shared by the parsers, the metric engine and the envelopes.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use uuid::Uuid;

use crate::errors::ParseError;

lazy_static! {
    /// `[d.]hh:mm:ss[.fff]`, the rendering used for durations on the wire.
    static ref TIME_SPAN_REGEX: Regex =
        Regex::new(r"^(?:(\d+)\.)?(\d+):([0-5]?\d):([0-5]?\d(?:\.\d+)?)$")
            .expect("failed creating regex");
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// 64 random bits. A v4 uuid fixes its version nibble and variant bits; the
/// top 48 and bottom 16 bits are outside both.
#[allow(clippy::cast_possible_truncation)]
fn random_u64() -> u64 {
    let bits = Uuid::new_v4().as_u128();
    (((bits >> 80) as u64) << 16) | (bits as u64 & 0xffff)
}

/// A fresh 32 character lowercase hex id, never all zeros.
#[must_use]
pub fn new_trace_id() -> String {
    loop {
        let (high, low) = (random_u64(), random_u64());
        if high | low != 0 {
            return format!("{high:016x}{low:016x}");
        }
    }
}

/// A fresh 16 character lowercase hex id, never all zeros.
#[must_use]
pub fn new_span_id() -> String {
    loop {
        let id = random_u64();
        if id != 0 {
            return format!("{id:016x}");
        }
    }
}

/// Renders a duration as `[d.]hh:mm:ss.fff`.
///
/// Negative and non-finite inputs render as zero.
///
/// ```
/// use appinsights_core::util::ms_to_time_span;
///
/// assert_eq!(ms_to_time_span(1500.0), "00:00:01.500");
/// assert_eq!(ms_to_time_span(90_061_001.0), "1.01:01:01.001");
/// ```
#[must_use]
pub fn ms_to_time_span(total_ms: f64) -> String {
    let total_ms = if total_ms.is_finite() && total_ms > 0.0 {
        total_ms
    } else {
        0.0
    };

    let mut sec = format!("{:.7}", (total_ms / 1000.0) % 60.0);
    let mut trimmed = 0;
    while trimmed < 4 && sec.ends_with('0') {
        sec.pop();
        trimmed += 1;
    }
    if sec.find('.').is_some_and(|dot| dot < 2) {
        sec.insert(0, '0');
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let whole_ms = total_ms.floor() as u64;
    let minutes = (whole_ms / 60_000) % 60;
    let hours = (whole_ms / 3_600_000) % 24;
    let days = whole_ms / 86_400_000;

    if days > 0 {
        format!("{days}.{hours:02}:{minutes:02}:{sec}")
    } else {
        format!("{hours:02}:{minutes:02}:{sec}")
    }
}

/// Parses a duration given either as plain milliseconds or as `[d.]hh:mm:ss[.fff]`.
pub fn parse_duration_ms(raw: &str) -> Result<f64, ParseError> {
    let trimmed = raw.trim();
    if let Ok(ms) = trimmed.parse::<f64>() {
        if ms.is_finite() && ms >= 0.0 {
            return Ok(ms);
        }
        return Err(ParseError::Duration(raw.to_string()));
    }

    let captures = TIME_SPAN_REGEX
        .captures(trimmed)
        .ok_or_else(|| ParseError::Duration(raw.to_string()))?;

    let field = |index: usize| -> Result<f64, ParseError> {
        captures
            .get(index)
            .map_or(Ok(0.0), |m| m.as_str().parse::<f64>())
            .map_err(|_| ParseError::Duration(raw.to_string()))
    };

    let days = field(1)?;
    let hours = field(2)?;
    let minutes = field(3)?;
    let seconds = field(4)?;

    Ok((((days * 24.0 + hours) * 60.0 + minutes) * 60.0 + seconds) * 1000.0)
}

/// Cuts `value` down to at most `max_chars` characters.
#[must_use]
pub fn truncate_chars(value: &str, max_chars: usize) -> &str {
    match value.char_indices().nth(max_chars) {
        Some((index, _)) => &value[..index],
        None => value,
    }
}

/// ISO-8601 timestamp with millisecond precision, as envelopes expect.
#[must_use]
pub fn format_timestamp(epoch_ms: u64) -> String {
    let datetime = i64::try_from(epoch_ms)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_default();
    datetime.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Whether `value` is exactly `len` lowercase hex characters and not all zeros.
#[must_use]
pub fn is_lower_hex_id(value: &str, len: usize) -> bool {
    value.len() == len
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        && value.bytes().any(|b| b != b'0')
}
