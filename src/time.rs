//! Instant parsing and timezone conversion at the intake boundary.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::engine::ValidationError;
use crate::limits::*;
use crate::model::{Ms, Span};

pub fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

/// Parse an RFC 3339 / ISO-8601 instant with offset, e.g. `2025-06-15T08:00:00Z`.
pub fn parse_instant(s: &str) -> Result<Ms, ValidationError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.timestamp_millis())
        .map_err(|_| ValidationError::MalformedTimestamp(s.to_string()))
}

/// Parse and validate an intake range; `end` must be after `start`.
pub fn parse_range(start: &str, end: &str) -> Result<Span, ValidationError> {
    let span = Span::try_new(parse_instant(start)?, parse_instant(end)?)
        .ok_or(ValidationError::EmptyRange)?;
    validate_span(&span)?;
    Ok(span)
}

pub fn parse_tz(name: &str) -> Result<Tz, ValidationError> {
    name.parse::<Tz>()
        .map_err(|_| ValidationError::UnknownTimezone(name.to_string()))
}

/// Resolve a wall-clock time in `tz` to UTC. Ambiguous times (DST fall-back)
/// resolve to the earlier instant; skipped times are rejected.
pub fn local_to_utc(local: NaiveDateTime, tz: Tz) -> Result<Ms, ValidationError> {
    tz.from_local_datetime(&local)
        .earliest()
        .map(|dt| dt.timestamp_millis())
        .ok_or_else(|| ValidationError::NonexistentLocalTime(local.to_string()))
}

pub fn local_range_to_utc(
    start: NaiveDateTime,
    end: NaiveDateTime,
    tz: Tz,
) -> Result<Span, ValidationError> {
    let span = Span::try_new(local_to_utc(start, tz)?, local_to_utc(end, tz)?)
        .ok_or(ValidationError::EmptyRange)?;
    validate_span(&span)?;
    Ok(span)
}

/// Like `local_to_utc`, but a time skipped by a DST jump resolves to the
/// first instant after the gap.
pub fn local_to_utc_forward(local: NaiveDateTime, tz: Tz) -> Result<Ms, ValidationError> {
    (0..=MAX_DST_GAP_MINUTES)
        .find_map(|m| {
            tz.from_local_datetime(&(local + Duration::minutes(m)))
                .earliest()
        })
        .map(|dt| dt.timestamp_millis())
        .ok_or_else(|| ValidationError::NonexistentLocalTime(local.to_string()))
}

/// `[local midnight of day, local midnight of the next day)` in UTC. A
/// midnight skipped by DST starts the day at the end of the gap.
pub fn day_bounds(day: NaiveDate, tz: Tz) -> Result<Span, ValidationError> {
    let next = day.succ_opt().ok_or(ValidationError::TimestampOutOfRange)?;
    let midnight = NaiveTime::from_hms_opt(0, 0, 0).ok_or(ValidationError::TimestampOutOfRange)?;
    let start = local_to_utc_forward(day.and_time(midnight), tz)?;
    let end = local_to_utc_forward(next.and_time(midnight), tz)?;
    Span::try_new(start, end).ok_or(ValidationError::EmptyRange)
}

/// The local calendar date in `tz` at instant `at`.
pub fn local_date(at: Ms, tz: Tz) -> Option<NaiveDate> {
    Utc.timestamp_millis_opt(at)
        .single()
        .map(|dt| dt.with_timezone(&tz).date_naive())
}

pub fn validate_span(span: &Span) -> Result<(), ValidationError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(ValidationError::TimestampOutOfRange);
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(ValidationError::SpanTooWide);
    }
    Ok(())
}
