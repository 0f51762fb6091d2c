//! Binary wire format for scalar types.

use bytes::{BufMut, BytesMut};
use uuid::Uuid;

use super::value::PgValue;
use super::Oid;
use crate::pg::error::{PgError, PgResult};

/// Copy out a value whose binary form has a fixed width.
pub(crate) fn fixed<const N: usize>(data: &[u8], name: &str) -> PgResult<[u8; N]> {
    data.try_into()
        .map_err(|_| PgError::decode(format!("invalid {} length: {}", name, data.len())))
}

fn utf8<'a>(data: &'a [u8], name: &str) -> PgResult<&'a str> {
    std::str::from_utf8(data)
        .map_err(|e| PgError::decode(format!("invalid UTF-8 in {}: {}", name, e)))
}

// ============================================================================
// Integers
// ============================================================================

/// The narrowest integer type that holds `v`.
pub fn int_oid(v: i64) -> Oid {
    if i16::try_from(v).is_ok() {
        Oid::INT2
    } else if i32::try_from(v).is_ok() {
        Oid::INT4
    } else {
        Oid::INT8
    }
}

/// Write `v` at the width of `oid` (one of the integer OIDs).
pub fn encode_int(v: i64, oid: Oid, buf: &mut BytesMut) -> PgResult<()> {
    let out_of_range = || PgError::NotSupported(format!("integer {} does not fit type {}", v, oid));
    match oid {
        Oid::INT2 => buf.put_i16(i16::try_from(v).map_err(|_| out_of_range())?),
        Oid::INT4 => buf.put_i32(i32::try_from(v).map_err(|_| out_of_range())?),
        _ => buf.put_i64(v),
    }
    Ok(())
}

pub fn decode_int2(data: &[u8]) -> PgResult<PgValue> {
    Ok(PgValue::Int(i16::from_be_bytes(fixed(data, "INT2")?) as i64))
}

pub fn decode_int4(data: &[u8]) -> PgResult<PgValue> {
    Ok(PgValue::Int(i32::from_be_bytes(fixed(data, "INT4")?) as i64))
}

pub fn decode_int8(data: &[u8]) -> PgResult<PgValue> {
    Ok(PgValue::Int(i64::from_be_bytes(fixed(data, "INT8")?)))
}

/// `oid`, `xid`, `cid` and `regproc` are unsigned 32-bit.
pub fn decode_uint4(data: &[u8]) -> PgResult<PgValue> {
    Ok(PgValue::Int(u32::from_be_bytes(fixed(data, "OID")?) as i64))
}

// ============================================================================
// Floats
// ============================================================================

/// `real` goes through its shortest decimal form so `1.1::real` reads back as 1.1.
pub fn decode_float4(data: &[u8]) -> PgResult<PgValue> {
    let v = f32::from_be_bytes(fixed(data, "FLOAT4")?);
    let widened = if v.is_finite() {
        v.to_string().parse().unwrap_or(v as f64)
    } else {
        v as f64
    };
    Ok(PgValue::Float(widened))
}

pub fn decode_float8(data: &[u8]) -> PgResult<PgValue> {
    Ok(PgValue::Float(f64::from_be_bytes(fixed(data, "FLOAT8")?)))
}

// ============================================================================
// Booleans, text, bytes
// ============================================================================

pub fn decode_bool(data: &[u8]) -> PgResult<PgValue> {
    let [b] = fixed::<1>(data, "BOOL")?;
    Ok(PgValue::Bool(b != 0))
}

pub fn decode_text(data: &[u8]) -> PgResult<PgValue> {
    Ok(PgValue::Text(utf8(data, "TEXT")?.to_string()))
}

/// The single-byte `"char"` type.
pub fn decode_char(data: &[u8]) -> PgResult<PgValue> {
    let [b] = fixed::<1>(data, "CHAR")?;
    Ok(PgValue::Text((b as char).to_string()))
}

pub fn decode_bytea(data: &[u8]) -> PgResult<PgValue> {
    Ok(PgValue::Bytea(data.to_vec()))
}

pub fn decode_uuid(data: &[u8]) -> PgResult<PgValue> {
    Ok(PgValue::Uuid(Uuid::from_bytes(fixed(data, "UUID")?)))
}

// ============================================================================
// JSON
// ============================================================================

const JSONB_VERSION: u8 = 1;

pub fn encode_json(value: &serde_json::Value, buf: &mut BytesMut) -> PgResult<()> {
    let text = serde_json::to_vec(value)
        .map_err(|e| PgError::NotSupported(format!("cannot serialize JSON: {}", e)))?;
    buf.put_slice(&text);
    Ok(())
}

pub fn encode_jsonb(value: &serde_json::Value, buf: &mut BytesMut) -> PgResult<()> {
    buf.put_u8(JSONB_VERSION);
    encode_json(value, buf)
}

pub fn decode_json(data: &[u8]) -> PgResult<PgValue> {
    serde_json::from_slice(data)
        .map(PgValue::Json)
        .map_err(|e| PgError::decode(format!("invalid JSON: {}", e)))
}

pub fn decode_jsonb(data: &[u8]) -> PgResult<PgValue> {
    match data.split_first() {
        Some((&JSONB_VERSION, rest)) => serde_json::from_slice(rest)
            .map(PgValue::Jsonb)
            .map_err(|e| PgError::decode(format!("invalid JSONB: {}", e))),
        Some((version, _)) => Err(PgError::decode(format!(
            "unsupported JSONB version: {}",
            version
        ))),
        None => Err(PgError::decode("empty JSONB value")),
    }
}
