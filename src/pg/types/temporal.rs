//! Date, time, timestamp and interval codecs.
//!
//! The binary forms count from the PostgreSQL epoch, 2000-01-01 00:00:00:
//! days for `date`, microseconds for `timestamp`/`timestamptz`, and
//! microseconds since midnight for `time`. `timestamptz` bytes are always UTC;
//! only the OID distinguishes it from `timestamp`.

use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut, BytesMut};
use chrono::{Datelike, DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Timelike, Utc};

use super::binary::fixed;
use super::value::PgValue;
use crate::pg::error::{PgError, PgResult};

/// Days from 0001-01-01 (CE) to 2000-01-01.
const PG_EPOCH_DAYS_FROM_CE: i32 = 730_120;

/// Microseconds from 1970-01-01 to 2000-01-01.
const PG_EPOCH_UNIX_MICROS: i64 = 946_684_800_000_000;

const MICROS_PER_SECOND: i64 = 1_000_000;
const MICROS_PER_DAY: i64 = 86_400 * MICROS_PER_SECOND;

fn infinity(positive: bool) -> PgValue {
    PgValue::Text(if positive { "infinity" } else { "-infinity" }.to_string())
}

// ============================================================================
// date
// ============================================================================

pub fn encode_date(date: &NaiveDate, buf: &mut BytesMut) {
    buf.put_i32(date.num_days_from_ce() - PG_EPOCH_DAYS_FROM_CE);
}

pub fn decode_date(data: &[u8]) -> PgResult<PgValue> {
    let days = i32::from_be_bytes(fixed(data, "DATE")?);
    match days {
        i32::MAX => return Ok(infinity(true)),
        i32::MIN => return Ok(infinity(false)),
        _ => {}
    }
    days.checked_add(PG_EPOCH_DAYS_FROM_CE)
        .and_then(NaiveDate::from_num_days_from_ce_opt)
        .map(PgValue::Date)
        .ok_or_else(|| PgError::decode(format!("DATE out of range: {} days", days)))
}

// ============================================================================
// time
// ============================================================================

pub fn encode_time(time: &NaiveTime, buf: &mut BytesMut) {
    let micros = time.num_seconds_from_midnight() as i64 * MICROS_PER_SECOND
        + (time.nanosecond() / 1_000) as i64;
    buf.put_i64(micros);
}

pub fn decode_time(data: &[u8]) -> PgResult<PgValue> {
    let micros = i64::from_be_bytes(fixed(data, "TIME")?);
    if micros == MICROS_PER_DAY {
        // 24:00:00 is a valid time of day on the server
        return Ok(PgValue::Text("24:00:00".to_string()));
    }
    time_from_micros(micros)
        .map(PgValue::Time)
        .ok_or_else(|| PgError::decode(format!("TIME out of range: {} us", micros)))
}

fn time_from_micros(micros: i64) -> Option<NaiveTime> {
    if !(0..MICROS_PER_DAY).contains(&micros) {
        return None;
    }
    let secs = (micros / MICROS_PER_SECOND) as u32;
    let nanos = (micros % MICROS_PER_SECOND) as u32 * 1_000;
    NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
}

// ============================================================================
// timestamp / timestamptz
// ============================================================================

pub fn encode_timestamp(ts: &NaiveDateTime, buf: &mut BytesMut) {
    buf.put_i64(ts.and_utc().timestamp_micros() - PG_EPOCH_UNIX_MICROS);
}

pub fn encode_timestamptz(ts: &DateTime<Utc>, buf: &mut BytesMut) {
    buf.put_i64(ts.timestamp_micros() - PG_EPOCH_UNIX_MICROS);
}

fn utc_from_pg_micros(micros: i64) -> PgResult<DateTime<Utc>> {
    micros
        .checked_add(PG_EPOCH_UNIX_MICROS)
        .and_then(DateTime::from_timestamp_micros)
        .ok_or_else(|| PgError::decode(format!("TIMESTAMP out of range: {} us", micros)))
}

pub fn decode_timestamp(data: &[u8]) -> PgResult<PgValue> {
    match i64::from_be_bytes(fixed(data, "TIMESTAMP")?) {
        i64::MAX => Ok(infinity(true)),
        i64::MIN => Ok(infinity(false)),
        micros => Ok(PgValue::Timestamp(utc_from_pg_micros(micros)?.naive_utc())),
    }
}

pub fn decode_timestamptz(data: &[u8]) -> PgResult<PgValue> {
    match i64::from_be_bytes(fixed(data, "TIMESTAMPTZ")?) {
        i64::MAX => Ok(infinity(true)),
        i64::MIN => Ok(infinity(false)),
        micros => Ok(PgValue::TimestampTz(utc_from_pg_micros(micros)?)),
    }
}

// ============================================================================
// interval
// ============================================================================

/// A PostgreSQL interval.
///
/// The three fields are independent on the server (a month is not a fixed
/// number of days, a day is not always 24 hours), so they are never merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interval {
    pub microseconds: i64,
    pub days: i32,
    pub months: i32,
}

impl Interval {
    pub fn new(months: i32, days: i32, microseconds: i64) -> Self {
        Interval {
            microseconds,
            days,
            months,
        }
    }

    /// Split a duration into whole days and remaining microseconds.
    pub fn from_duration(duration: TimeDelta) -> PgResult<Self> {
        let micros = duration.num_microseconds().ok_or_else(|| {
            PgError::NotSupported("duration too large for an interval".to_string())
        })?;
        let days = i32::try_from(micros / MICROS_PER_DAY).map_err(|_| {
            PgError::NotSupported("duration too large for an interval".to_string())
        })?;
        Ok(Interval::new(0, days, micros % MICROS_PER_DAY))
    }

    /// Exact duration, available only when there is no month component.
    pub fn to_duration(&self) -> Option<TimeDelta> {
        if self.months != 0 {
            return None;
        }
        TimeDelta::try_days(self.days as i64)?
            .checked_add(&TimeDelta::microseconds(self.microseconds))
    }

    pub fn encode_binary(&self, buf: &mut BytesMut) {
        buf.put_i64(self.microseconds);
        buf.put_i32(self.days);
        buf.put_i32(self.months);
    }

    pub fn decode_binary(data: &[u8]) -> PgResult<Self> {
        let raw: [u8; 16] = fixed(data, "INTERVAL")?;
        let mut buf = &raw[..];
        Ok(Interval {
            microseconds: buf.get_i64(),
            days: buf.get_i32(),
            months: buf.get_i32(),
        })
    }
}

pub fn decode_interval(data: &[u8]) -> PgResult<PgValue> {
    Interval::decode_binary(data).map(PgValue::Interval)
}

fn plural(n: i64, unit: &str) -> String {
    if n == 1 {
        format!("{} {}", n, unit)
    } else {
        format!("{} {}s", n, unit)
    }
}

/// Formats in the server's default `postgres` interval style.
impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        let years = self.months / 12;
        let mons = self.months % 12;
        if years != 0 {
            parts.push(plural(years as i64, "year"));
        }
        if mons != 0 {
            parts.push(plural(mons as i64, "mon"));
        }
        if self.days != 0 {
            parts.push(plural(self.days as i64, "day"));
        }
        if self.microseconds != 0 || parts.is_empty() {
            let negative_date_part = self.months < 0 || self.days < 0;
            let sign = if self.microseconds < 0 {
                "-"
            } else if negative_date_part {
                "+"
            } else {
                ""
            };
            let total = self.microseconds.unsigned_abs();
            let secs = total / MICROS_PER_SECOND as u64;
            let frac = total % MICROS_PER_SECOND as u64;
            let mut clock = format!(
                "{}{:02}:{:02}:{:02}",
                sign,
                secs / 3600,
                (secs / 60) % 60,
                secs % 60
            );
            if frac != 0 {
                let digits = format!("{:06}", frac);
                clock.push('.');
                clock.push_str(digits.trim_end_matches('0'));
            }
            parts.push(clock);
        }
        f.write_str(&parts.join(" "))
    }
}

/// Parses the `postgres` interval style (`1 year 2 mons -3 days +04:05:06.5`),
/// including the verbose unit names and a trailing `ago`.
impl FromStr for Interval {
    type Err = PgError;

    fn from_str(s: &str) -> PgResult<Self> {
        let invalid = || PgError::decode(format!("invalid interval: {:?}", s));
        let mut interval = Interval::default();
        let mut tokens = s.split_whitespace().peekable();
        let mut ago = false;

        while let Some(token) = tokens.next() {
            if token.eq_ignore_ascii_case("ago") {
                ago = true;
                continue;
            }
            if token.contains(':') {
                interval.microseconds += parse_clock(token).ok_or_else(invalid)?;
                continue;
            }
            let token = token.trim_start_matches('@');
            if token.is_empty() {
                continue;
            }
            let amount: f64 = token.parse().map_err(|_| invalid())?;
            let unit = tokens.next().ok_or_else(invalid)?.to_ascii_lowercase();
            let unit = unit.trim_end_matches(',');
            match unit.trim_end_matches('s') {
                "year" | "yr" => interval.months += (amount * 12.0) as i32,
                "mon" | "month" => interval.months += amount as i32,
                "week" => interval.days += (amount * 7.0) as i32,
                "day" => interval.days += amount as i32,
                "hour" | "hr" => {
                    interval.microseconds += (amount * 3600.0 * MICROS_PER_SECOND as f64) as i64
                }
                "min" | "minute" => {
                    interval.microseconds += (amount * 60.0 * MICROS_PER_SECOND as f64) as i64
                }
                "sec" | "second" => {
                    interval.microseconds += (amount * MICROS_PER_SECOND as f64) as i64
                }
                _ => return Err(invalid()),
            }
        }

        if ago {
            interval.months = -interval.months;
            interval.days = -interval.days;
            interval.microseconds = -interval.microseconds;
        }
        Ok(interval)
    }
}

/// `[+-]hh:mm[:ss[.ffffff]]` to microseconds.
fn parse_clock(token: &str) -> Option<i64> {
    let (negative, body) = match token.as_bytes().first()? {
        b'-' => (true, &token[1..]),
        b'+' => (false, &token[1..]),
        _ => (false, token),
    };
    let mut fields = body.split(':');
    let hours: i64 = fields.next()?.parse().ok()?;
    let minutes: i64 = fields.next()?.parse().ok()?;
    let seconds = fields.next().unwrap_or("0");
    let (whole, frac) = seconds.split_once('.').unwrap_or((seconds, ""));
    let whole: i64 = whole.parse().ok()?;
    let frac_micros: i64 = if frac.is_empty() {
        0
    } else {
        let padded = format!("{:0<6}", &frac[..frac.len().min(6)]);
        padded.parse().ok()?
    };
    let micros = ((hours * 60 + minutes) * 60 + whole) * MICROS_PER_SECOND + frac_micros;
    Some(if negative { -micros } else { micros })
}
