//! PostgreSQL type codecs.
//!
//! Values travel as [`PgValue`]. Outgoing parameters are dispatched on their
//! [`ValueKind`] to one encoder each; incoming column data is dispatched on its
//! type [`Oid`]. Both tables live in the process-wide [`TypeRegistry`].
//!
//! - [`value`] - the closed value model
//! - [`registry`] - OID table, encoder table, per-connection overrides
//! - [`binary`] / [`text`] - scalar wire formats
//! - [`numeric`], [`temporal`], [`network`] - exact numeric, date/time and inet types
//! - [`array`] - array shape inspection and the array wire format
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES

pub mod array;
pub mod binary;
pub mod network;
pub mod numeric;
pub mod registry;
pub mod temporal;
pub mod text;
pub mod value;

pub use network::Inet;
pub use numeric::Numeric;
pub use registry::{registry, DecodeHook, EncodeHook, EncodedParam, TypeOverrides, TypeRegistry};
pub use temporal::Interval;
pub use value::{PgValue, ValueKind};

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifiers (OIDs).
///
/// These are the built-in type OIDs from PostgreSQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oid(pub i32);

impl Oid {
    /// Unspecified; lets the server infer the parameter type.
    pub const UNSPECIFIED: Oid = Oid(0);

    // Boolean types
    pub const BOOL: Oid = Oid(16);

    // Binary data
    pub const BYTEA: Oid = Oid(17);

    // Character types
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);

    // Integer types
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT2VECTOR: Oid = Oid(22);
    pub const INT4: Oid = Oid(23);
    pub const REGPROC: Oid = Oid(24);

    // Text types
    pub const TEXT: Oid = Oid(25);

    // Object identifier types
    pub const OID_TYPE: Oid = Oid(26);
    pub const XID: Oid = Oid(28);
    pub const CID: Oid = Oid(29);
    pub const OIDVECTOR: Oid = Oid(30);

    // JSON and XML
    pub const JSON: Oid = Oid(114);
    pub const XML: Oid = Oid(142);
    pub const JSONB: Oid = Oid(3802);

    // Floating point types
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);

    // Pseudo type for literals of unknown type
    pub const UNKNOWN: Oid = Oid(705);

    // Money
    pub const MONEY: Oid = Oid(790);

    // Network types
    pub const CIDR: Oid = Oid(650);
    pub const INET: Oid = Oid(869);
    pub const MACADDR: Oid = Oid(829);

    // String types
    pub const BPCHAR: Oid = Oid(1042);
    pub const VARCHAR: Oid = Oid(1043);

    // Date/time types
    pub const DATE: Oid = Oid(1082);
    pub const TIME: Oid = Oid(1083);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const INTERVAL: Oid = Oid(1186);
    pub const TIMETZ: Oid = Oid(1266);

    // Numeric
    pub const NUMERIC: Oid = Oid(1700);

    // UUID
    pub const UUID: Oid = Oid(2950);

    // Array types
    pub const JSON_ARRAY: Oid = Oid(199);
    pub const CIDR_ARRAY: Oid = Oid(651);
    pub const BOOL_ARRAY: Oid = Oid(1000);
    pub const BYTEA_ARRAY: Oid = Oid(1001);
    pub const CHAR_ARRAY: Oid = Oid(1002);
    pub const NAME_ARRAY: Oid = Oid(1003);
    pub const INT2_ARRAY: Oid = Oid(1005);
    pub const INT4_ARRAY: Oid = Oid(1007);
    pub const TEXT_ARRAY: Oid = Oid(1009);
    pub const BPCHAR_ARRAY: Oid = Oid(1014);
    pub const VARCHAR_ARRAY: Oid = Oid(1015);
    pub const INT8_ARRAY: Oid = Oid(1016);
    pub const FLOAT4_ARRAY: Oid = Oid(1021);
    pub const FLOAT8_ARRAY: Oid = Oid(1022);
    pub const OID_ARRAY: Oid = Oid(1028);
    pub const INET_ARRAY: Oid = Oid(1041);
    pub const TIMESTAMP_ARRAY: Oid = Oid(1115);
    pub const DATE_ARRAY: Oid = Oid(1182);
    pub const TIME_ARRAY: Oid = Oid(1183);
    pub const TIMESTAMPTZ_ARRAY: Oid = Oid(1185);
    pub const INTERVAL_ARRAY: Oid = Oid(1187);
    pub const NUMERIC_ARRAY: Oid = Oid(1231);
    pub const CSTRING_ARRAY: Oid = Oid(1263);
    pub const UUID_ARRAY: Oid = Oid(2951);
    pub const JSONB_ARRAY: Oid = Oid(3807);

    /// Create from raw i32 value
    #[inline]
    pub fn from_i32(oid: i32) -> Self {
        Oid(oid)
    }

    /// Get the raw i32 value
    #[inline]
    pub fn as_i32(self) -> i32 {
        self.0
    }

    /// Check if this is a text-like type
    pub fn is_text_like(self) -> bool {
        matches!(
            self,
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::NAME | Oid::UNKNOWN | Oid::XML
        )
    }

    /// Check if this is an integer type
    pub fn is_integer(self) -> bool {
        matches!(self, Oid::INT2 | Oid::INT4 | Oid::INT8)
    }

    /// Check if this is a floating point type
    pub fn is_float(self) -> bool {
        matches!(self, Oid::FLOAT4 | Oid::FLOAT8)
    }

    /// Check if this is a registered array type
    pub fn is_array(self) -> bool {
        registry().element_oid(self).is_some()
    }
}

impl std::fmt::Display for Oid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
