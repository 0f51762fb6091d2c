//! Text wire format decoders.
//!
//! Used for columns requested in text format: types without a binary codec,
//! columns with a registered decode hook, and connections configured for text
//! results. Output follows the server defaults (`DateStyle=ISO`,
//! `IntervalStyle=postgres`, `bytea_output=hex`).

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};

use super::network::Inet;
use super::numeric::Numeric;
use super::temporal::Interval;
use super::value::PgValue;
use crate::pg::error::{PgError, PgResult};

fn text<'a>(data: &'a [u8], name: &str) -> PgResult<&'a str> {
    std::str::from_utf8(data)
        .map_err(|e| PgError::decode(format!("invalid UTF-8 in {}: {}", name, e)))
}

fn invalid(name: &str, s: &str) -> PgError {
    PgError::decode(format!("invalid {} text value: {:?}", name, s))
}

fn infinity(s: &str) -> Option<PgValue> {
    matches!(s, "infinity" | "-infinity").then(|| PgValue::Text(s.to_string()))
}

pub fn decode_bool(data: &[u8]) -> PgResult<PgValue> {
    match text(data, "BOOL")? {
        "t" | "true" => Ok(PgValue::Bool(true)),
        "f" | "false" => Ok(PgValue::Bool(false)),
        other => Err(invalid("BOOL", other)),
    }
}

pub fn decode_int(data: &[u8]) -> PgResult<PgValue> {
    let s = text(data, "INT")?;
    s.parse().map(PgValue::Int).map_err(|_| invalid("INT", s))
}

pub fn decode_float(data: &[u8]) -> PgResult<PgValue> {
    let s = text(data, "FLOAT")?;
    let v = match s {
        "NaN" => f64::NAN,
        "Infinity" => f64::INFINITY,
        "-Infinity" => f64::NEG_INFINITY,
        _ => s.parse().map_err(|_| invalid("FLOAT", s))?,
    };
    Ok(PgValue::Float(v))
}

pub fn decode_numeric(data: &[u8]) -> PgResult<PgValue> {
    let s = text(data, "NUMERIC")?;
    s.parse::<Numeric>()
        .map(PgValue::Numeric)
        .map_err(|_| invalid("NUMERIC", s))
}

pub fn decode_text(data: &[u8]) -> PgResult<PgValue> {
    Ok(PgValue::Text(text(data, "TEXT")?.to_string()))
}

/// Hex (`\x0a0b`) or legacy escape (`a\012\\`) bytea output.
pub fn decode_bytea(data: &[u8]) -> PgResult<PgValue> {
    if let Some(hex) = data.strip_prefix(b"\\x") {
        if hex.len() % 2 != 0 {
            return Err(PgError::decode("odd-length hex BYTEA value"));
        }
        let nibble = |c: u8| -> PgResult<u8> {
            (c as char)
                .to_digit(16)
                .map(|d| d as u8)
                .ok_or_else(|| PgError::decode(format!("invalid hex digit in BYTEA: {:?}", c as char)))
        };
        let bytes = hex
            .chunks(2)
            .map(|pair| Ok(nibble(pair[0])? << 4 | nibble(pair[1])?))
            .collect::<PgResult<Vec<u8>>>()?;
        return Ok(PgValue::Bytea(bytes));
    }

    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        match data[i] {
            b'\\' if data.get(i + 1) == Some(&b'\\') => {
                out.push(b'\\');
                i += 2;
            }
            b'\\' => {
                let octal = data
                    .get(i + 1..i + 4)
                    .and_then(|d| std::str::from_utf8(d).ok())
                    .and_then(|d| u8::from_str_radix(d, 8).ok())
                    .ok_or_else(|| PgError::decode("invalid escape in BYTEA value"))?;
                out.push(octal);
                i += 4;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    Ok(PgValue::Bytea(out))
}

pub fn decode_uuid(data: &[u8]) -> PgResult<PgValue> {
    let s = text(data, "UUID")?;
    uuid::Uuid::parse_str(s)
        .map(PgValue::Uuid)
        .map_err(|_| invalid("UUID", s))
}

pub fn decode_json(data: &[u8]) -> PgResult<PgValue> {
    serde_json::from_slice(data)
        .map(PgValue::Json)
        .map_err(|e| PgError::decode(format!("invalid JSON: {}", e)))
}

pub fn decode_jsonb(data: &[u8]) -> PgResult<PgValue> {
    serde_json::from_slice(data)
        .map(PgValue::Jsonb)
        .map_err(|e| PgError::decode(format!("invalid JSONB: {}", e)))
}

pub fn decode_date(data: &[u8]) -> PgResult<PgValue> {
    let s = text(data, "DATE")?;
    if let Some(v) = infinity(s) {
        return Ok(v);
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map(PgValue::Date)
        .map_err(|_| invalid("DATE", s))
}

pub fn decode_time(data: &[u8]) -> PgResult<PgValue> {
    let s = text(data, "TIME")?;
    NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
        .map(PgValue::Time)
        .map_err(|_| invalid("TIME", s))
}

pub fn decode_timestamp(data: &[u8]) -> PgResult<PgValue> {
    let s = text(data, "TIMESTAMP")?;
    if let Some(v) = infinity(s) {
        return Ok(v);
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .map(PgValue::Timestamp)
        .map_err(|_| invalid("TIMESTAMP", s))
}

/// Offsets arrive as `+hh`, `+hh:mm` or `+hh:mm:ss`; seconds are dropped.
pub fn decode_timestamptz(data: &[u8]) -> PgResult<PgValue> {
    let s = text(data, "TIMESTAMPTZ")?;
    if let Some(v) = infinity(s) {
        return Ok(v);
    }
    let split = s
        .rfind(['+', '-'])
        .filter(|pos| *pos > 10)
        .ok_or_else(|| invalid("TIMESTAMPTZ", s))?;
    let (stamp, offset) = s.split_at(split);
    let mut offset = offset.to_string();
    match offset.matches(':').count() {
        0 => offset.push_str(":00"),
        2 => offset.truncate(offset.len() - 3),
        _ => {}
    }
    DateTime::parse_from_str(&format!("{}{}", stamp, offset), "%Y-%m-%d %H:%M:%S%.f%:z")
        .map(|ts| PgValue::TimestampTz(ts.with_timezone(&chrono::Utc)))
        .map_err(|_| invalid("TIMESTAMPTZ", s))
}

pub fn decode_interval(data: &[u8]) -> PgResult<PgValue> {
    text(data, "INTERVAL")?
        .parse::<Interval>()
        .map(PgValue::Interval)
}

pub fn decode_inet(data: &[u8]) -> PgResult<PgValue> {
    text(data, "INET")?.parse::<Inet>().map(PgValue::Inet)
}

/// `int2vector` and `oidvector`: space separated integers.
pub fn decode_int_vector(data: &[u8]) -> PgResult<PgValue> {
    let s = text(data, "INT2VECTOR")?;
    s.split_ascii_whitespace()
        .map(|n| n.parse().map(PgValue::Int).map_err(|_| invalid("INT2VECTOR", s)))
        .collect::<PgResult<Vec<_>>>()
        .map(PgValue::Array)
}
