//! The value model shared by parameters and result rows.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use std::net::IpAddr;
use uuid::Uuid;

use super::network::Inet;
use super::numeric::Numeric;
use super::temporal::Interval;

/// A PostgreSQL value.
///
/// Integers are carried as `i64` and narrowed to the smallest wire type that
/// fits when sent. `Array` holds nested `Array`s for multi-dimensional values.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Numeric(Numeric),
    Text(String),
    Bytea(Vec<u8>),
    Uuid(Uuid),
    Json(serde_json::Value),
    Jsonb(serde_json::Value),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    /// Timestamp with time zone, normalized to UTC.
    TimestampTz(DateTime<Utc>),
    Interval(Interval),
    Inet(Inet),
    Array(Vec<PgValue>),
}

/// The variant of a [`PgValue`], used as the encoder dispatch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    Float,
    Numeric,
    Text,
    Bytea,
    Uuid,
    Json,
    Jsonb,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Interval,
    Inet,
    Array,
}

impl PgValue {
    /// Build an array from anything convertible to values.
    pub fn array<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<PgValue>,
    {
        PgValue::Array(items.into_iter().map(Into::into).collect())
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            PgValue::Null => ValueKind::Null,
            PgValue::Bool(_) => ValueKind::Bool,
            PgValue::Int(_) => ValueKind::Int,
            PgValue::Float(_) => ValueKind::Float,
            PgValue::Numeric(_) => ValueKind::Numeric,
            PgValue::Text(_) => ValueKind::Text,
            PgValue::Bytea(_) => ValueKind::Bytea,
            PgValue::Uuid(_) => ValueKind::Uuid,
            PgValue::Json(_) => ValueKind::Json,
            PgValue::Jsonb(_) => ValueKind::Jsonb,
            PgValue::Date(_) => ValueKind::Date,
            PgValue::Time(_) => ValueKind::Time,
            PgValue::Timestamp(_) => ValueKind::Timestamp,
            PgValue::TimestampTz(_) => ValueKind::TimestampTz,
            PgValue::Interval(_) => ValueKind::Interval,
            PgValue::Inet(_) => ValueKind::Inet,
            PgValue::Array(_) => ValueKind::Array,
        }
    }

    /// Check if this value is NULL
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, PgValue::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PgValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PgValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PgValue::Float(v) => Some(*v),
            PgValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PgValue::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            PgValue::Bytea(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[PgValue]> {
        match self {
            PgValue::Array(v) => Some(v),
            _ => None,
        }
    }
}

// ============================================================================
// Conversions
// ============================================================================

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for PgValue {
                fn from(v: $ty) -> Self {
                    PgValue::$variant(v.into())
                }
            }
        )*
    };
}

impl_from! {
    bool => Bool,
    i16 => Int,
    i32 => Int,
    i64 => Int,
    u16 => Int,
    u32 => Int,
    f32 => Float,
    f64 => Float,
    String => Text,
    &str => Text,
    Vec<u8> => Bytea,
    &[u8] => Bytea,
    Numeric => Numeric,
    Uuid => Uuid,
    serde_json::Value => Jsonb,
    NaiveDate => Date,
    NaiveTime => Time,
    NaiveDateTime => Timestamp,
    DateTime<Utc> => TimestampTz,
    Interval => Interval,
    Inet => Inet,
    IpAddr => Inet,
    Vec<PgValue> => Array,
}

impl<T: Into<PgValue>> From<Option<T>> for PgValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(PgValue::Null, Into::into)
    }
}
