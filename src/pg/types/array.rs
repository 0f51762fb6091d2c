//! Arrays.
//!
//! Outgoing arrays are nested `PgValue::Array`s. Before anything is written the
//! nesting is checked: every sibling must have the same length, all leaves
//! must share one element type, and at least one leaf must be non-null.
//!
//! Binary layout:
//!
//! ```text
//! i32 ndim | i32 has_null | i32 element oid | (i32 len, i32 lower bound) * ndim
//! then per leaf: i32 byte length (-1 for NULL) followed by the bytes
//! ```

use bytes::{Buf, BufMut, BytesMut};
use smallvec::SmallVec;

use super::binary;
use super::registry::TypeRegistry;
use super::value::{PgValue, ValueKind};
use super::Oid;
use crate::pg::error::{PgError, PgResult};
use crate::pg::protocol::Format;

/// The server rejects arrays with more dimensions than this.
pub const MAX_DIMENSIONS: usize = 6;

type Dims = SmallVec<[usize; MAX_DIMENSIONS]>;

/// Shape and element type of an outgoing array.
#[derive(Debug, PartialEq)]
pub struct ArrayShape<'a> {
    pub dims: Dims,
    pub element: Oid,
    pub leaves: Vec<&'a PgValue>,
}

impl ArrayShape<'_> {
    pub fn has_null(&self) -> bool {
        self.leaves.iter().any(|v| v.is_null())
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }
}

/// Check the nesting of `items` and work out its element type.
pub fn inspect(items: &[PgValue]) -> PgResult<ArrayShape<'_>> {
    let mut dims = Dims::new();
    dims.push(items.len());
    let mut first = items.first();
    while let Some(PgValue::Array(inner)) = first {
        if dims.len() == MAX_DIMENSIONS {
            return Err(PgError::ArrayContentNotSupported(format!(
                "arrays are limited to {} dimensions",
                MAX_DIMENSIONS
            )));
        }
        dims.push(inner.len());
        first = inner.first();
    }

    let mut leaves = Vec::new();
    collect_leaves(items, &dims, &mut leaves)?;

    if leaves.is_empty() {
        return Ok(ArrayShape {
            dims: Dims::new(),
            element: Oid::TEXT,
            leaves,
        });
    }

    let element = element_oid(&leaves)?;
    Ok(ArrayShape {
        dims,
        element,
        leaves,
    })
}

fn collect_leaves<'a>(items: &'a [PgValue], dims: &[usize], out: &mut Vec<&'a PgValue>) -> PgResult<()> {
    let (&len, rest) = dims
        .split_first()
        .ok_or(PgError::ArrayDimensionsNotConsistent)?;
    if items.len() != len {
        return Err(PgError::ArrayDimensionsNotConsistent);
    }
    for item in items {
        match item {
            PgValue::Array(inner) if !rest.is_empty() => collect_leaves(inner, rest, out)?,
            PgValue::Array(_) => return Err(PgError::ArrayDimensionsNotConsistent),
            _ if !rest.is_empty() => return Err(PgError::ArrayDimensionsNotConsistent),
            leaf => out.push(leaf),
        }
    }
    Ok(())
}

/// The element OID shared by every non-null leaf.
fn element_oid(leaves: &[&PgValue]) -> PgResult<Oid> {
    let mut values = leaves.iter().filter(|v| !v.is_null());
    let first = values.next().ok_or(PgError::ArrayContentEmpty)?;
    let kind = first.kind();

    if kind == ValueKind::Int {
        let mut widest = Oid::INT2;
        for value in std::iter::once(first).chain(values) {
            match value {
                PgValue::Int(v) => {
                    let oid = binary::int_oid(*v);
                    if int_rank(oid) > int_rank(widest) {
                        widest = oid;
                    }
                }
                other => return Err(not_homogeneous(kind, other)),
            }
        }
        return Ok(widest);
    }

    if let Some(other) = values.find(|v| v.kind() != kind) {
        return Err(not_homogeneous(kind, other));
    }
    scalar_element_oid(kind).ok_or_else(|| {
        PgError::ArrayContentNotSupported(format!("{:?} values cannot be array elements", kind))
    })
}

fn not_homogeneous(kind: ValueKind, other: &PgValue) -> PgError {
    PgError::ArrayContentNotHomogeneous(format!(
        "not all array elements are of type {:?} (found {:?})",
        kind,
        other.kind()
    ))
}

fn scalar_element_oid(kind: ValueKind) -> Option<Oid> {
    Some(match kind {
        ValueKind::Bool => Oid::BOOL,
        ValueKind::Float => Oid::FLOAT8,
        ValueKind::Numeric => Oid::NUMERIC,
        ValueKind::Text => Oid::TEXT,
        ValueKind::Bytea => Oid::BYTEA,
        ValueKind::Uuid => Oid::UUID,
        ValueKind::Json => Oid::JSON,
        ValueKind::Jsonb => Oid::JSONB,
        ValueKind::Date => Oid::DATE,
        ValueKind::Time => Oid::TIME,
        ValueKind::Timestamp => Oid::TIMESTAMP,
        ValueKind::TimestampTz => Oid::TIMESTAMPTZ,
        ValueKind::Interval => Oid::INTERVAL,
        ValueKind::Inet => Oid::INET,
        ValueKind::Int | ValueKind::Null | ValueKind::Array => return None,
    })
}

/// Integer OID values do not follow width order (INT8 = 20 < INT2 = 21).
fn int_rank(oid: Oid) -> u8 {
    match oid {
        Oid::INT2 => 0,
        Oid::INT4 => 1,
        _ => 2,
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Write the binary form of `items` and return the array type OID.
pub fn encode(registry: &TypeRegistry, items: &[PgValue], buf: &mut BytesMut) -> PgResult<Oid> {
    let shape = inspect(items)?;
    let array_oid = registry.array_oid(shape.element).ok_or_else(|| {
        PgError::ArrayContentNotSupported(format!("no array type for element {}", shape.element))
    })?;

    buf.put_i32(shape.dims.len() as i32);
    buf.put_i32(shape.has_null() as i32);
    buf.put_i32(shape.element.as_i32());
    for len in &shape.dims {
        buf.put_i32(*len as i32);
        buf.put_i32(1);
    }

    let mut scratch = BytesMut::new();
    for leaf in &shape.leaves {
        if leaf.is_null() {
            buf.put_i32(-1);
            continue;
        }
        scratch.clear();
        match leaf {
            PgValue::Int(v) => binary::encode_int(*v, shape.element, &mut scratch)?,
            other => {
                registry.encode_scalar(other, &mut scratch)?;
            }
        }
        buf.put_i32(scratch.len() as i32);
        buf.put_slice(&scratch);
    }
    Ok(array_oid)
}

// ============================================================================
// Decoding
// ============================================================================

fn take_i32(data: &mut &[u8]) -> PgResult<i32> {
    if data.remaining() < 4 {
        return Err(PgError::decode("truncated array value"));
    }
    Ok(data.get_i32())
}

/// Decode the binary form into nested arrays.
pub fn decode_binary(registry: &TypeRegistry, mut data: &[u8]) -> PgResult<PgValue> {
    let ndim = take_i32(&mut data)?;
    let _has_null = take_i32(&mut data)?;
    let element = Oid(take_i32(&mut data)?);
    if !(0..=MAX_DIMENSIONS as i32).contains(&ndim) {
        return Err(PgError::decode(format!("invalid array dimension count: {}", ndim)));
    }
    if ndim == 0 {
        return Ok(PgValue::Array(Vec::new()));
    }

    let mut dims = Dims::new();
    for _ in 0..ndim {
        let len = take_i32(&mut data)?;
        let _lower_bound = take_i32(&mut data)?;
        if len < 0 {
            return Err(PgError::decode(format!("negative array dimension: {}", len)));
        }
        dims.push(len as usize);
    }

    let count = dims
        .iter()
        .try_fold(1usize, |acc, &len| acc.checked_mul(len))
        .ok_or_else(|| PgError::decode("array dimensions overflow"))?;
    let mut leaves = Vec::with_capacity(count.min(data.len() / 4));
    for _ in 0..count {
        let len = take_i32(&mut data)?;
        if len < 0 {
            leaves.push(PgValue::Null);
            continue;
        }
        let len = len as usize;
        if data.len() < len {
            return Err(PgError::decode("truncated array element"));
        }
        let (value, rest) = data.split_at(len);
        leaves.push(registry.decode(element, Format::Binary, value)?);
        data = rest;
    }
    if !data.is_empty() {
        return Err(PgError::decode("trailing bytes after array value"));
    }

    let mut leaves = leaves.into_iter();
    Ok(nest(&dims, &mut leaves))
}

fn nest(dims: &[usize], leaves: &mut impl Iterator<Item = PgValue>) -> PgValue {
    match dims.split_first() {
        Some((&len, [])) => PgValue::Array(leaves.take(len).collect()),
        Some((&len, rest)) => PgValue::Array((0..len).map(|_| nest(rest, leaves)).collect()),
        None => PgValue::Array(Vec::new()),
    }
}

/// Decode the text form (`{1,NULL,"a b",{2}}`) using the element's text decoder.
pub fn decode_text(registry: &TypeRegistry, element: Oid, data: &[u8]) -> PgResult<PgValue> {
    let text = std::str::from_utf8(data)
        .map_err(|e| PgError::decode(format!("invalid UTF-8 in array: {}", e)))?;
    // Non-default lower bounds are written as a "[1:2]=" prefix.
    let body = match text.strip_prefix('[') {
        Some(_) => text
            .split_once('=')
            .map(|(_, body)| body)
            .ok_or_else(|| PgError::decode("invalid array bounds"))?,
        None => text,
    };
    let mut parser = TextArrayParser {
        input: body.as_bytes(),
        pos: 0,
        registry,
        element,
    };
    let value = parser.parse_array()?;
    if parser.pos != parser.input.len() {
        return Err(PgError::decode("trailing characters after array value"));
    }
    Ok(value)
}

struct TextArrayParser<'a> {
    input: &'a [u8],
    pos: usize,
    registry: &'a TypeRegistry,
    element: Oid,
}

impl<'a> TextArrayParser<'a> {
    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn expect(&mut self, byte: u8) -> PgResult<()> {
        if self.peek() != Some(byte) {
            return Err(PgError::decode(format!(
                "expected {:?} at offset {} in array",
                byte as char, self.pos
            )));
        }
        self.pos += 1;
        Ok(())
    }

    fn parse_array(&mut self) -> PgResult<PgValue> {
        self.expect(b'{')?;
        let mut items = Vec::new();
        if self.peek() == Some(b'}') {
            self.pos += 1;
            return Ok(PgValue::Array(items));
        }
        loop {
            let item = match self.peek() {
                Some(b'{') => self.parse_array()?,
                Some(b'"') => {
                    let raw = self.parse_quoted()?;
                    self.registry
                        .decode(self.element, Format::Text, raw.as_bytes())?
                }
                _ => {
                    let raw = self.parse_unquoted();
                    if raw.eq_ignore_ascii_case("NULL") {
                        PgValue::Null
                    } else {
                        self.registry
                            .decode(self.element, Format::Text, raw.as_bytes())?
                    }
                }
            };
            items.push(item);
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b'}') => {
                    self.pos += 1;
                    return Ok(PgValue::Array(items));
                }
                _ => return Err(PgError::decode("unterminated array value")),
            }
        }
    }

    fn parse_quoted(&mut self) -> PgResult<String> {
        self.expect(b'"')?;
        let mut out = Vec::new();
        loop {
            match self.peek() {
                Some(b'\\') => {
                    let escaped = self
                        .input
                        .get(self.pos + 1)
                        .copied()
                        .ok_or_else(|| PgError::decode("unterminated escape in array"))?;
                    out.push(escaped);
                    self.pos += 2;
                }
                Some(b'"') => {
                    self.pos += 1;
                    break;
                }
                Some(b) => {
                    out.push(b);
                    self.pos += 1;
                }
                None => return Err(PgError::decode("unterminated quoted array element")),
            }
        }
        String::from_utf8(out).map_err(|e| PgError::decode(format!("invalid UTF-8 in array: {}", e)))
    }

    fn parse_unquoted(&mut self) -> &'a str {
        let input = self.input;
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b == b',' || b == b'}' {
                break;
            }
            self.pos += 1;
        }
        // Bounds fall on ASCII delimiters, so the slice stays valid UTF-8.
        std::str::from_utf8(&input[start..self.pos])
            .unwrap_or_default()
            .trim()
    }
}
