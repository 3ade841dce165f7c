//! Five-field cron evaluator.
//!
//! Parses the classic `minute hour day-of-month month day-of-week` syntax and
//! answers "when does this spec fire next?". Each field accepts `*`, a
//! comma-separated list of `N` or `N-M` ranges, and an optional `/S` step that
//! keeps the values where `(v - range_start) % S == 0`.
//!
//! The current time is obtained through the injectable [`Clock`] trait so
//! that schedule arithmetic stays deterministic in tests.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Timelike};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Clock abstraction (injectable for testing)
// ---------------------------------------------------------------------------

/// Provides the current wall-clock minute.
///
/// Production code uses [`SystemClock`]; tests substitute a fixed instant so
/// that `next_after` arithmetic can be asserted exactly.
pub trait Clock: Send + Sync {
    /// Returns the current local date and time.
    fn now(&self) -> NaiveDateTime;
}

/// The default [`Clock`] implementation backed by the system clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

// ---------------------------------------------------------------------------
// CronError
// ---------------------------------------------------------------------------

/// Returned when a cron spec string cannot be parsed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CronError {
    /// The spec is syntactically invalid or a numeric value is out of range.
    #[error("invalid cron spec '{spec}': {reason}")]
    InvalidSpec { spec: String, reason: String },
}

// ---------------------------------------------------------------------------
// Field bitsets
// ---------------------------------------------------------------------------

/// One cron field as a bitset over its value range.
///
/// Bit `v - lo` is set when value `v` is allowed. The widest field (minutes)
/// needs 60 bits, so a `u64` covers every field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet {
    bits: u64,
    lo: u8,
    hi: u8,
}

impl FieldSet {
    fn contains(&self, value: u8) -> bool {
        value >= self.lo && value <= self.hi && (self.bits >> (value - self.lo)) & 1 == 1
    }
}

fn parse_num(text: &str) -> Result<u8, String> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("expected a number, got '{text}'"));
    }
    text.parse::<u8>().map_err(|_| format!("number out of range: '{text}'"))
}

/// Set the bits for `start..=end`, thinned by the optional step relative to
/// `range_start`.
fn range_bits(start: u8, end: u8, range_start: u8, step: Option<u8>, lo: u8) -> u64 {
    let mut bits = 0u64;
    for v in start..=end {
        if let Some(s) = step {
            if (v - range_start) % s != 0 {
                continue;
            }
        }
        bits |= 1 << (v - lo);
    }
    bits
}

fn parse_field(field: &str, lo: u8, hi: u8) -> Result<FieldSet, String> {
    let parse_step = |text: &str| -> Result<u8, String> {
        let step = parse_num(text)?;
        if step == 0 {
            return Err("step must be > 0".into());
        }
        Ok(step)
    };

    if field == "*" {
        return Ok(FieldSet { bits: range_bits(lo, hi, lo, None, lo), lo, hi });
    }
    if let Some(step) = field.strip_prefix("*/") {
        let step = parse_step(step)?;
        return Ok(FieldSet { bits: range_bits(lo, hi, lo, Some(step), lo), lo, hi });
    }

    let mut bits = 0u64;
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(parse_step(step)?)),
            None => (item, None),
        };
        let (start, end) = match range.split_once('-') {
            Some((a, b)) => (parse_num(a)?, parse_num(b)?),
            None => {
                let v = parse_num(range)?;
                (v, v)
            }
        };
        if start < lo || end > hi {
            return Err(format!("value out of range {lo}-{hi}: '{range}'"));
        }
        if start > end {
            return Err(format!("empty range: '{range}'"));
        }
        bits |= range_bits(start, end, start, step, lo);
    }
    if bits == 0 {
        return Err("field selects no values".into());
    }
    Ok(FieldSet { bits, lo, hi })
}

// ---------------------------------------------------------------------------
// CronSpec
// ---------------------------------------------------------------------------

/// How far `next_after` searches before declaring a spec unsatisfiable
/// (e.g. `0 0 30 2 *`). Four years covers every leap-year combination.
const SEARCH_HORIZON_DAYS: i64 = 4 * 366;

/// A parsed five-field cron spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSpec {
    source: String,
    minute: FieldSet,
    hour: FieldSet,
    dom: FieldSet,
    month: FieldSet,
    dow: FieldSet,
}

impl CronSpec {
    /// Parse `minute hour day-of-month month day-of-week`.
    ///
    /// # Errors
    ///
    /// Returns [`CronError::InvalidSpec`] when the spec does not have exactly
    /// five fields, a field fails to parse, or a value exceeds its range.
    pub fn parse(spec: &str) -> Result<Self, CronError> {
        let invalid = |reason: String| CronError::InvalidSpec { spec: spec.to_string(), reason };

        let fields: Vec<&str> = spec.split_whitespace().collect();
        let &[minute, hour, dom, month, dow] = fields.as_slice() else {
            return Err(invalid(format!("expected 5 fields, got {}", fields.len())));
        };

        Ok(Self {
            source: spec.to_string(),
            minute: parse_field(minute, 0, 59).map_err(|r| invalid(format!("minute: {r}")))?,
            hour: parse_field(hour, 0, 23).map_err(|r| invalid(format!("hour: {r}")))?,
            dom: parse_field(dom, 1, 31).map_err(|r| invalid(format!("day-of-month: {r}")))?,
            month: parse_field(month, 1, 12).map_err(|r| invalid(format!("month: {r}")))?,
            dow: parse_field(dow, 0, 6).map_err(|r| invalid(format!("day-of-week: {r}")))?,
        })
    }

    /// The spec string as given.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether `t` (ignoring seconds) satisfies this spec.
    pub fn matches(&self, t: NaiveDateTime) -> bool {
        self.minute.contains(t.minute() as u8)
            && self.hour.contains(t.hour() as u8)
            && self.dom.contains(t.day() as u8)
            && self.month.contains(t.month() as u8)
            && self.dow.contains(t.weekday().num_days_from_sunday() as u8)
    }

    /// The earliest instant strictly after `from` (whole minutes, seconds
    /// zeroed) that satisfies this spec, or `None` when no instant within the
    /// search horizon does.
    ///
    /// Fields are checked from the most to the least significant; advancing a
    /// field resets every lower field to its minimum, and the loop re-checks
    /// from the top so that day arithmetic rolls through month and year
    /// boundaries naturally.
    pub fn next_after(&self, from: NaiveDateTime) -> Option<NaiveDateTime> {
        let start = truncate_minute(from) + Duration::minutes(1);
        let horizon = start + Duration::days(SEARCH_HORIZON_DAYS);

        let mut t = start;
        while t <= horizon {
            if !self.month.contains(t.month() as u8) {
                t = first_of_next_month(t.date())?.and_hms_opt(0, 0, 0)?;
            } else if !self.dom.contains(t.day() as u8)
                || !self.dow.contains(t.weekday().num_days_from_sunday() as u8)
            {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
            } else if !self.hour.contains(t.hour() as u8) {
                t = truncate_minute(t).with_minute(0)? + Duration::hours(1);
            } else if !self.minute.contains(t.minute() as u8) {
                t += Duration::minutes(1);
            } else {
                return Some(t);
            }
        }
        None
    }
}

fn truncate_minute(t: NaiveDateTime) -> NaiveDateTime {
    t.with_second(0).and_then(|t| t.with_nanosecond(0)).unwrap_or(t)
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDate> {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
