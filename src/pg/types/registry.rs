//! The type registry.
//!
//! One immutable [`TypeRegistry`] is built on first use and shared by every
//! connection. It holds two tables:
//!
//! - encoders keyed by [`ValueKind`], each choosing the wire type for a value
//! - codecs keyed by [`Oid`], each decoding one column type in text and
//!   (where supported) binary format
//!
//! Connections layer [`TypeOverrides`] on top for user conversion hooks; the
//! shared registry itself is never mutated.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use once_cell::sync::Lazy;

use super::array;
use super::binary;
use super::network::{self, Inet};
use super::numeric::Numeric;
use super::temporal;
use super::text;
use super::value::{PgValue, ValueKind};
use super::Oid;
use crate::pg::error::{BoxError, PgError, PgResult};
use crate::pg::protocol::Format;

/// Decodes one value of a column type.
pub type DecodeFn = fn(&[u8]) -> PgResult<PgValue>;

/// Writes one value and returns the OID it was written as.
type EncodeFn = fn(&TypeRegistry, &PgValue, &mut BytesMut) -> PgResult<Oid>;

static REGISTRY: Lazy<TypeRegistry> = Lazy::new(TypeRegistry::builtin);

/// The process-wide registry of built-in codecs.
pub fn registry() -> &'static TypeRegistry {
    &REGISTRY
}

#[derive(Clone, Copy)]
enum CodecKind {
    Scalar {
        binary: Option<DecodeFn>,
        text: DecodeFn,
    },
    Array {
        element: Oid,
    },
}

/// Decoder entry for one type OID.
#[derive(Clone, Copy)]
pub struct TypeCodec {
    pub oid: Oid,
    pub name: &'static str,
    kind: CodecKind,
}

impl fmt::Debug for TypeCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeCodec")
            .field("oid", &self.oid)
            .field("name", &self.name)
            .finish()
    }
}

struct Encoder {
    format: Format,
    encode: EncodeFn,
}

/// An encoded Bind parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedParam {
    pub oid: Oid,
    pub format: Format,
    /// `None` for NULL.
    pub value: Option<Bytes>,
}

/// Codec tables for all built-in types.
pub struct TypeRegistry {
    codecs: HashMap<Oid, TypeCodec>,
    arrays: HashMap<Oid, Oid>,
    encoders: HashMap<ValueKind, Encoder>,
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("codecs", &self.codecs.len())
            .field("encoders", &self.encoders.len())
            .finish()
    }
}

impl TypeRegistry {
    fn builtin() -> Self {
        let mut registry = TypeRegistry {
            codecs: HashMap::new(),
            arrays: HashMap::new(),
            encoders: HashMap::new(),
        };
        registry.register_scalars();
        registry.register_arrays();
        registry.register_encoders();
        registry
    }

    fn scalar(&mut self, oid: Oid, name: &'static str, binary: Option<DecodeFn>, text: DecodeFn) {
        self.codecs.insert(
            oid,
            TypeCodec {
                oid,
                name,
                kind: CodecKind::Scalar { binary, text },
            },
        );
    }

    fn register_scalars(&mut self) {
        self.scalar(Oid::BOOL, "bool", Some(binary::decode_bool), text::decode_bool);
        self.scalar(Oid::BYTEA, "bytea", Some(binary::decode_bytea), text::decode_bytea);
        self.scalar(Oid::CHAR, "char", Some(binary::decode_char), text::decode_text);

        for (oid, name) in [
            (Oid::NAME, "name"),
            (Oid::TEXT, "text"),
            (Oid::VARCHAR, "varchar"),
            (Oid::BPCHAR, "bpchar"),
            (Oid::UNKNOWN, "unknown"),
            (Oid::XML, "xml"),
        ] {
            self.scalar(oid, name, Some(binary::decode_text), text::decode_text);
        }

        self.scalar(Oid::INT2, "int2", Some(binary::decode_int2), text::decode_int);
        self.scalar(Oid::INT4, "int4", Some(binary::decode_int4), text::decode_int);
        self.scalar(Oid::INT8, "int8", Some(binary::decode_int8), text::decode_int);
        self.scalar(Oid::OID_TYPE, "oid", Some(binary::decode_uint4), text::decode_int);
        self.scalar(Oid::XID, "xid", Some(binary::decode_uint4), text::decode_int);
        self.scalar(Oid::CID, "cid", Some(binary::decode_uint4), text::decode_int);
        self.scalar(Oid::INT2VECTOR, "int2vector", None, text::decode_int_vector);
        self.scalar(Oid::OIDVECTOR, "oidvector", None, text::decode_int_vector);

        self.scalar(Oid::FLOAT4, "float4", Some(binary::decode_float4), text::decode_float);
        self.scalar(Oid::FLOAT8, "float8", Some(binary::decode_float8), text::decode_float);
        self.scalar(
            Oid::NUMERIC,
            "numeric",
            Some(|data| Numeric::decode_binary(data).map(PgValue::Numeric)),
            text::decode_numeric,
        );

        self.scalar(Oid::DATE, "date", Some(temporal::decode_date), text::decode_date);
        self.scalar(Oid::TIME, "time", Some(temporal::decode_time), text::decode_time);
        self.scalar(
            Oid::TIMESTAMP,
            "timestamp",
            Some(temporal::decode_timestamp),
            text::decode_timestamp,
        );
        self.scalar(
            Oid::TIMESTAMPTZ,
            "timestamptz",
            Some(temporal::decode_timestamptz),
            text::decode_timestamptz,
        );
        self.scalar(
            Oid::INTERVAL,
            "interval",
            Some(temporal::decode_interval),
            text::decode_interval,
        );

        self.scalar(Oid::UUID, "uuid", Some(binary::decode_uuid), text::decode_uuid);
        self.scalar(Oid::JSON, "json", Some(binary::decode_json), text::decode_json);
        self.scalar(Oid::JSONB, "jsonb", Some(binary::decode_jsonb), text::decode_jsonb);
        self.scalar(Oid::INET, "inet", Some(network::decode_inet), text::decode_inet);
        self.scalar(Oid::CIDR, "cidr", Some(network::decode_inet), text::decode_inet);
    }

    fn register_arrays(&mut self) {
        for (array, element, name) in [
            (Oid::BOOL_ARRAY, Oid::BOOL, "_bool"),
            (Oid::BYTEA_ARRAY, Oid::BYTEA, "_bytea"),
            (Oid::CHAR_ARRAY, Oid::CHAR, "_char"),
            (Oid::NAME_ARRAY, Oid::NAME, "_name"),
            (Oid::INT2_ARRAY, Oid::INT2, "_int2"),
            (Oid::INT4_ARRAY, Oid::INT4, "_int4"),
            (Oid::INT8_ARRAY, Oid::INT8, "_int8"),
            (Oid::TEXT_ARRAY, Oid::TEXT, "_text"),
            (Oid::BPCHAR_ARRAY, Oid::BPCHAR, "_bpchar"),
            (Oid::VARCHAR_ARRAY, Oid::VARCHAR, "_varchar"),
            (Oid::OID_ARRAY, Oid::OID_TYPE, "_oid"),
            (Oid::FLOAT4_ARRAY, Oid::FLOAT4, "_float4"),
            (Oid::FLOAT8_ARRAY, Oid::FLOAT8, "_float8"),
            (Oid::NUMERIC_ARRAY, Oid::NUMERIC, "_numeric"),
            (Oid::DATE_ARRAY, Oid::DATE, "_date"),
            (Oid::TIME_ARRAY, Oid::TIME, "_time"),
            (Oid::TIMESTAMP_ARRAY, Oid::TIMESTAMP, "_timestamp"),
            (Oid::TIMESTAMPTZ_ARRAY, Oid::TIMESTAMPTZ, "_timestamptz"),
            (Oid::INTERVAL_ARRAY, Oid::INTERVAL, "_interval"),
            (Oid::UUID_ARRAY, Oid::UUID, "_uuid"),
            (Oid::JSON_ARRAY, Oid::JSON, "_json"),
            (Oid::JSONB_ARRAY, Oid::JSONB, "_jsonb"),
            (Oid::INET_ARRAY, Oid::INET, "_inet"),
            (Oid::CIDR_ARRAY, Oid::CIDR, "_cidr"),
        ] {
            self.codecs.insert(
                array,
                TypeCodec {
                    oid: array,
                    name,
                    kind: CodecKind::Array { element },
                },
            );
            self.arrays.insert(element, array);
        }
    }

    fn register_encoders(&mut self) {
        let mut add = |kind, format, encode: EncodeFn| {
            self.encoders.insert(kind, Encoder { format, encode });
        };

        add(ValueKind::Bool, Format::Binary, |_, v, buf| match v {
            PgValue::Bool(b) => {
                buf.put_u8(*b as u8);
                Ok(Oid::BOOL)
            }
            other => Err(mismatch(other)),
        });
        add(ValueKind::Int, Format::Binary, |_, v, buf| match v {
            PgValue::Int(n) => {
                let oid = binary::int_oid(*n);
                binary::encode_int(*n, oid, buf)?;
                Ok(oid)
            }
            other => Err(mismatch(other)),
        });
        add(ValueKind::Float, Format::Binary, |_, v, buf| match v {
            PgValue::Float(f) => {
                buf.put_f64(*f);
                Ok(Oid::FLOAT8)
            }
            other => Err(mismatch(other)),
        });
        add(ValueKind::Numeric, Format::Binary, |_, v, buf| match v {
            PgValue::Numeric(n) => {
                n.encode_binary(buf);
                Ok(Oid::NUMERIC)
            }
            other => Err(mismatch(other)),
        });
        // Strings go out as `unknown` text so the server picks the column type.
        add(ValueKind::Text, Format::Text, |_, v, buf| match v {
            PgValue::Text(s) => {
                buf.put_slice(s.as_bytes());
                Ok(Oid::UNKNOWN)
            }
            other => Err(mismatch(other)),
        });
        add(ValueKind::Bytea, Format::Binary, |_, v, buf| match v {
            PgValue::Bytea(b) => {
                buf.put_slice(b);
                Ok(Oid::BYTEA)
            }
            other => Err(mismatch(other)),
        });
        add(ValueKind::Uuid, Format::Binary, |_, v, buf| match v {
            PgValue::Uuid(u) => {
                buf.put_slice(u.as_bytes());
                Ok(Oid::UUID)
            }
            other => Err(mismatch(other)),
        });
        add(ValueKind::Json, Format::Binary, |_, v, buf| match v {
            PgValue::Json(j) => binary::encode_json(j, buf).map(|_| Oid::JSON),
            other => Err(mismatch(other)),
        });
        add(ValueKind::Jsonb, Format::Binary, |_, v, buf| match v {
            PgValue::Jsonb(j) => binary::encode_jsonb(j, buf).map(|_| Oid::JSONB),
            other => Err(mismatch(other)),
        });
        add(ValueKind::Date, Format::Binary, |_, v, buf| match v {
            PgValue::Date(d) => {
                temporal::encode_date(d, buf);
                Ok(Oid::DATE)
            }
            other => Err(mismatch(other)),
        });
        add(ValueKind::Time, Format::Binary, |_, v, buf| match v {
            PgValue::Time(t) => {
                temporal::encode_time(t, buf);
                Ok(Oid::TIME)
            }
            other => Err(mismatch(other)),
        });
        add(ValueKind::Timestamp, Format::Binary, |_, v, buf| match v {
            PgValue::Timestamp(ts) => {
                temporal::encode_timestamp(ts, buf);
                Ok(Oid::TIMESTAMP)
            }
            other => Err(mismatch(other)),
        });
        add(ValueKind::TimestampTz, Format::Binary, |_, v, buf| match v {
            PgValue::TimestampTz(ts) => {
                temporal::encode_timestamptz(ts, buf);
                Ok(Oid::TIMESTAMPTZ)
            }
            other => Err(mismatch(other)),
        });
        add(ValueKind::Interval, Format::Binary, |_, v, buf| match v {
            PgValue::Interval(i) => {
                i.encode_binary(buf);
                Ok(Oid::INTERVAL)
            }
            other => Err(mismatch(other)),
        });
        add(ValueKind::Inet, Format::Binary, |_, v, buf| match v {
            PgValue::Inet(inet) => {
                Inet::encode_binary(inet, buf);
                Ok(Oid::INET)
            }
            other => Err(mismatch(other)),
        });
        add(ValueKind::Array, Format::Binary, |registry, v, buf| match v {
            PgValue::Array(items) => array::encode(registry, items, buf),
            other => Err(mismatch(other)),
        });
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    pub fn get(&self, oid: Oid) -> Option<&TypeCodec> {
        self.codecs.get(&oid)
    }

    /// Array type whose elements are `element`.
    pub fn array_oid(&self, element: Oid) -> Option<Oid> {
        self.arrays.get(&element).copied()
    }

    /// Element type of the array type `array`.
    pub fn element_oid(&self, array: Oid) -> Option<Oid> {
        match self.codecs.get(&array)?.kind {
            CodecKind::Array { element } => Some(element),
            CodecKind::Scalar { .. } => None,
        }
    }

    /// Whether values of `oid` can be decoded from binary format.
    pub fn has_binary(&self, oid: Oid) -> bool {
        match self.codecs.get(&oid).map(|c| c.kind) {
            Some(CodecKind::Scalar { binary, .. }) => binary.is_some(),
            Some(CodecKind::Array { element }) => self.has_binary(element),
            None => false,
        }
    }

    // ========================================================================
    // Encoding
    // ========================================================================

    /// Encode a Bind parameter.
    pub fn encode(&self, value: &PgValue) -> PgResult<EncodedParam> {
        if value.is_null() {
            return Ok(EncodedParam {
                oid: Oid::UNKNOWN,
                format: Format::Text,
                value: None,
            });
        }
        let encoder = self.encoder(value)?;
        let mut buf = BytesMut::new();
        let oid = (encoder.encode)(self, value, &mut buf)?;
        Ok(EncodedParam {
            oid,
            format: encoder.format,
            value: Some(buf.freeze()),
        })
    }

    /// Write a non-null value into `buf` and return its OID.
    pub fn encode_scalar(&self, value: &PgValue, buf: &mut BytesMut) -> PgResult<Oid> {
        let encoder = self.encoder(value)?;
        (encoder.encode)(self, value, buf)
    }

    fn encoder(&self, value: &PgValue) -> PgResult<&Encoder> {
        self.encoders.get(&value.kind()).ok_or_else(|| {
            PgError::NotSupported(format!("no encoder for {:?} values", value.kind()))
        })
    }

    // ========================================================================
    // Decoding
    // ========================================================================

    /// Decode a non-null column value. Unknown types in text format come back
    /// as `PgValue::Text`.
    pub fn decode(&self, oid: Oid, format: Format, data: &[u8]) -> PgResult<PgValue> {
        match (self.codecs.get(&oid).map(|c| c.kind), format) {
            (Some(CodecKind::Scalar { binary: Some(f), .. }), Format::Binary) => f(data),
            (Some(CodecKind::Scalar { text: f, .. }), Format::Text) => f(data),
            (Some(CodecKind::Array { .. }), Format::Binary) => array::decode_binary(self, data),
            (Some(CodecKind::Array { element }), Format::Text) => {
                array::decode_text(self, element, data)
            }
            (None, Format::Text) => text::decode_text(data),
            (_, Format::Binary) => Err(PgError::decode(format!(
                "no binary decoder for type {}",
                oid
            ))),
        }
    }
}

fn mismatch(value: &PgValue) -> PgError {
    PgError::NotSupported(format!("encoder does not accept {:?}", value.kind()))
}

// ============================================================================
// Overrides
// ============================================================================

/// Produces the text form of a parameter.
pub type EncodeHook = Arc<dyn Fn(&PgValue) -> Result<Vec<u8>, BoxError> + Send + Sync>;

/// Converts the text form of a column value.
pub type DecodeHook = Arc<dyn Fn(&str) -> Result<PgValue, BoxError> + Send + Sync>;

/// Per-connection conversion hooks layered over the shared registry.
///
/// Encode hooks replace the encoder for one [`ValueKind`] and send their
/// output in text format as the given OID. Decode hooks replace the decoder
/// for one column OID; such columns are requested in text format. Errors
/// returned by a hook surface as [`PgError::Hook`] with the original error
/// inside.
#[derive(Clone, Default)]
pub struct TypeOverrides {
    encoders: HashMap<ValueKind, (Oid, EncodeHook)>,
    decoders: HashMap<Oid, DecodeHook>,
}

impl fmt::Debug for TypeOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeOverrides")
            .field("encoders", &self.encoders.keys().collect::<Vec<_>>())
            .field("decoders", &self.decoders.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TypeOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_encoder<F>(&mut self, kind: ValueKind, oid: Oid, hook: F)
    where
        F: Fn(&PgValue) -> Result<Vec<u8>, BoxError> + Send + Sync + 'static,
    {
        self.encoders.insert(kind, (oid, Arc::new(hook)));
    }

    pub fn register_decoder<F>(&mut self, oid: Oid, hook: F)
    where
        F: Fn(&str) -> Result<PgValue, BoxError> + Send + Sync + 'static,
    {
        self.decoders.insert(oid, Arc::new(hook));
    }

    pub fn remove_encoder(&mut self, kind: ValueKind) -> bool {
        self.encoders.remove(&kind).is_some()
    }

    pub fn remove_decoder(&mut self, oid: Oid) -> bool {
        self.decoders.remove(&oid).is_some()
    }

    pub fn clear(&mut self) {
        self.encoders.clear();
        self.decoders.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.encoders.is_empty() && self.decoders.is_empty()
    }

    /// Encode a parameter, preferring a registered hook.
    pub fn encode(&self, registry: &TypeRegistry, value: &PgValue) -> PgResult<EncodedParam> {
        if value.is_null() {
            return registry.encode(value);
        }
        match self.encoders.get(&value.kind()) {
            Some((oid, hook)) => {
                let bytes = hook(value).map_err(PgError::Hook)?;
                Ok(EncodedParam {
                    oid: *oid,
                    format: Format::Text,
                    value: Some(Bytes::from(bytes)),
                })
            }
            None => registry.encode(value),
        }
    }

    /// Format to request for a result column of type `oid`.
    pub fn result_format(&self, registry: &TypeRegistry, oid: Oid, prefer_binary: bool) -> Format {
        if prefer_binary && !self.decoders.contains_key(&oid) && registry.has_binary(oid) {
            Format::Binary
        } else {
            Format::Text
        }
    }

    /// Decode a non-null column value, preferring a registered hook.
    pub fn decode(
        &self,
        registry: &TypeRegistry,
        oid: Oid,
        format: Format,
        data: &[u8],
    ) -> PgResult<PgValue> {
        match (self.decoders.get(&oid), format) {
            (Some(hook), Format::Text) => {
                let text = std::str::from_utf8(data)
                    .map_err(|e| PgError::decode(format!("invalid UTF-8 in column: {}", e)))?;
                hook(text).map_err(PgError::Hook)
            }
            _ => registry.decode(oid, format, data),
        }
    }
}
