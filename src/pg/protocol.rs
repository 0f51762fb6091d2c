//! PostgreSQL wire protocol message encoding and decoding.
//!
//! This module implements the PostgreSQL v3 protocol messages.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use super::error::{PgError, PgResult};
use super::types::{EncodedParam, Oid};

// ============================================================================
// Protocol Constants
// ============================================================================

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// Request code sent in place of a protocol version to ask for TLS
pub const SSL_REQUEST_CODE: i32 = 80877103; // (1234 << 16) | 5679

/// Request code for an out-of-band query cancel
pub const CANCEL_REQUEST_CODE: i32 = 80877102; // (1234 << 16) | 5678

/// Format codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum Format {
    Text = 0,
    Binary = 1,
}

impl Format {
    fn from_i16(code: i16) -> PgResult<Self> {
        match code {
            0 => Ok(Format::Text),
            1 => Ok(Format::Binary),
            other => Err(PgError::protocol(format!("invalid format code {}", other))),
        }
    }
}

/// Transaction status indicators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Idle (not in a transaction block)
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    Failed,
}

impl TransactionStatus {
    pub fn as_byte(self) -> u8 {
        match self {
            TransactionStatus::Idle => b'I',
            TransactionStatus::InTransaction => b'T',
            TransactionStatus::Failed => b'E',
        }
    }
}

impl TryFrom<u8> for TransactionStatus {
    type Error = PgError;

    fn try_from(b: u8) -> PgResult<Self> {
        match b {
            b'I' => Ok(TransactionStatus::Idle),
            b'T' => Ok(TransactionStatus::InTransaction),
            b'E' => Ok(TransactionStatus::Failed),
            other => Err(PgError::protocol(format!(
                "invalid transaction status {:?}",
                other as char
            ))),
        }
    }
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// Trait for encoding frontend messages.
///
/// Every message is written as an optional type byte, an i32 length that
/// counts itself, then the body.
pub trait FrontendMessage {
    /// Message type byte; `None` for the untagged startup-phase packets.
    const TAG: Option<u8>;

    fn encode_body(&self, buf: &mut BytesMut);

    fn encode_to(&self, buf: &mut BytesMut) {
        if let Some(tag) = Self::TAG {
            buf.put_u8(tag);
        }
        let start = buf.len();
        buf.put_i32(0);
        self.encode_body(buf);
        let len = (buf.len() - start) as i32;
        buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
    }

    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.encode_to(&mut buf);
        buf
    }
}

fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Startup message sent at connection start
#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub user: String,
    pub database: Option<String>,
    pub options: Vec<(String, String)>,
}

impl FrontendMessage for StartupMessage {
    const TAG: Option<u8> = None;

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_i32(PROTOCOL_VERSION);

        put_cstring(buf, "user");
        put_cstring(buf, &self.user);

        if let Some(ref db) = self.database {
            put_cstring(buf, "database");
            put_cstring(buf, db);
        }

        for (key, value) in &self.options {
            put_cstring(buf, key);
            put_cstring(buf, value);
        }

        // Terminator
        buf.put_u8(0);
    }
}

/// SSLRequest, answered by a single `S` or `N` byte
#[derive(Debug, Clone, Copy)]
pub struct SslRequestMessage;

impl FrontendMessage for SslRequestMessage {
    const TAG: Option<u8> = None;

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_i32(SSL_REQUEST_CODE);
    }
}

/// CancelRequest, sent on its own connection
#[derive(Debug, Clone, Copy)]
pub struct CancelRequestMessage {
    pub process_id: i32,
    pub secret_key: i32,
}

impl FrontendMessage for CancelRequestMessage {
    const TAG: Option<u8> = None;

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_i32(CANCEL_REQUEST_CODE);
        buf.put_i32(self.process_id);
        buf.put_i32(self.secret_key);
    }
}

/// Password message (for MD5 or plaintext auth)
#[derive(Debug, Clone)]
pub struct PasswordMessage {
    pub password: String,
}

impl FrontendMessage for PasswordMessage {
    const TAG: Option<u8> = Some(b'p');

    fn encode_body(&self, buf: &mut BytesMut) {
        put_cstring(buf, &self.password);
    }
}

/// SASL Initial Response message ('p') - First SCRAM message
#[derive(Debug, Clone)]
pub struct SaslInitialResponseMessage {
    /// SASL mechanism name (e.g., "SCRAM-SHA-256")
    pub mechanism: String,
    /// Initial client response data
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslInitialResponseMessage {
    const TAG: Option<u8> = Some(b'p');

    fn encode_body(&self, buf: &mut BytesMut) {
        put_cstring(buf, &self.mechanism);
        buf.put_i32(self.data.len() as i32);
        buf.put_slice(&self.data);
    }
}

/// SASL Response message ('p') - Subsequent SCRAM messages
#[derive(Debug, Clone)]
pub struct SaslResponseMessage {
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslResponseMessage {
    const TAG: Option<u8> = Some(b'p');

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.data);
    }
}

/// Simple query message ('Q')
#[derive(Debug, Clone)]
pub struct QueryMessage {
    pub query: String,
}

impl FrontendMessage for QueryMessage {
    const TAG: Option<u8> = Some(b'Q');

    fn encode_body(&self, buf: &mut BytesMut) {
        put_cstring(buf, &self.query);
    }
}

/// Parse message ('P') - Creates a prepared statement
#[derive(Debug, Clone)]
pub struct ParseMessage {
    pub name: String,
    pub query: String,
    pub param_types: Vec<Oid>,
}

impl FrontendMessage for ParseMessage {
    const TAG: Option<u8> = Some(b'P');

    fn encode_body(&self, buf: &mut BytesMut) {
        put_cstring(buf, &self.name);
        put_cstring(buf, &self.query);
        buf.put_u16(self.param_types.len() as u16);
        for oid in &self.param_types {
            buf.put_i32(oid.as_i32());
        }
    }
}

/// Bind message ('B') - Binds parameters to a prepared statement
#[derive(Debug, Clone)]
pub struct BindMessage {
    pub portal: String,
    pub statement: String,
    pub params: Vec<EncodedParam>,
    pub result_formats: Vec<Format>,
}

impl FrontendMessage for BindMessage {
    const TAG: Option<u8> = Some(b'B');

    fn encode_body(&self, buf: &mut BytesMut) {
        put_cstring(buf, &self.portal);
        put_cstring(buf, &self.statement);

        buf.put_u16(self.params.len() as u16);
        for param in &self.params {
            buf.put_i16(param.format as i16);
        }

        buf.put_u16(self.params.len() as u16);
        for param in &self.params {
            match &param.value {
                Some(bytes) => {
                    buf.put_i32(bytes.len() as i32);
                    buf.put_slice(bytes);
                }
                None => buf.put_i32(-1),
            }
        }

        // A single code applies to every column
        match self.result_formats.split_first() {
            Some((first, rest)) if rest.iter().all(|f| f == first) => {
                buf.put_i16(1);
                buf.put_i16(*first as i16);
            }
            _ => {
                buf.put_i16(self.result_formats.len() as i16);
                for fmt in &self.result_formats {
                    buf.put_i16(*fmt as i16);
                }
            }
        }
    }
}

/// Execute message ('E') - Executes a bound portal
#[derive(Debug, Clone)]
pub struct ExecuteMessage {
    pub portal: String,
    /// 0 = no limit
    pub max_rows: i32,
}

impl FrontendMessage for ExecuteMessage {
    const TAG: Option<u8> = Some(b'E');

    fn encode_body(&self, buf: &mut BytesMut) {
        put_cstring(buf, &self.portal);
        buf.put_i32(self.max_rows);
    }
}

/// Target of a Describe or Close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Statement,
    Portal,
}

impl Target {
    fn as_byte(self) -> u8 {
        match self {
            Target::Statement => b'S',
            Target::Portal => b'P',
        }
    }
}

/// Describe message ('D') - Request description of statement or portal
#[derive(Debug, Clone)]
pub struct DescribeMessage {
    pub target: Target,
    pub name: String,
}

impl FrontendMessage for DescribeMessage {
    const TAG: Option<u8> = Some(b'D');

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u8(self.target.as_byte());
        put_cstring(buf, &self.name);
    }
}

/// Close message ('C') - Release a prepared statement or portal
#[derive(Debug, Clone)]
pub struct CloseMessage {
    pub target: Target,
    pub name: String,
}

impl FrontendMessage for CloseMessage {
    const TAG: Option<u8> = Some(b'C');

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u8(self.target.as_byte());
        put_cstring(buf, &self.name);
    }
}

/// Sync message ('S') - Marks end of an extended query
#[derive(Debug, Clone, Copy)]
pub struct SyncMessage;

impl FrontendMessage for SyncMessage {
    const TAG: Option<u8> = Some(b'S');

    fn encode_body(&self, _buf: &mut BytesMut) {}
}

/// Flush message ('H') - Request server to flush output buffer
#[derive(Debug, Clone, Copy)]
pub struct FlushMessage;

impl FrontendMessage for FlushMessage {
    const TAG: Option<u8> = Some(b'H');

    fn encode_body(&self, _buf: &mut BytesMut) {}
}

/// Terminate message ('X') - Close the connection
#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    const TAG: Option<u8> = Some(b'X');

    fn encode_body(&self, _buf: &mut BytesMut) {}
}

/// CopyData message ('d') - One chunk of COPY FROM STDIN input
#[derive(Debug, Clone)]
pub struct CopyDataMessage<'a> {
    pub data: &'a [u8],
}

impl FrontendMessage for CopyDataMessage<'_> {
    const TAG: Option<u8> = Some(b'd');

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_slice(self.data);
    }
}

/// CopyDone message ('c')
#[derive(Debug, Clone, Copy)]
pub struct CopyDoneMessage;

impl FrontendMessage for CopyDoneMessage {
    const TAG: Option<u8> = Some(b'c');

    fn encode_body(&self, _buf: &mut BytesMut) {}
}

/// CopyFail message ('f') - Abort COPY FROM STDIN with a reason
#[derive(Debug, Clone)]
pub struct CopyFailMessage {
    pub reason: String,
}

impl FrontendMessage for CopyFailMessage {
    const TAG: Option<u8> = Some(b'f');

    fn encode_body(&self, buf: &mut BytesMut) {
        put_cstring(buf, &self.reason);
    }
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// Field description in a RowDescription message
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: Format,
}

/// Backend message types
#[derive(Debug, Clone, PartialEq)]
pub enum BackendMessage {
    // Authentication
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password {
        salt: [u8; 4],
    },
    AuthenticationSASL {
        mechanisms: Vec<String>,
    },
    AuthenticationSASLContinue {
        data: Bytes,
    },
    AuthenticationSASLFinal {
        data: Bytes,
    },
    /// Any other authentication request code
    AuthenticationOther {
        code: i32,
    },

    // Query responses
    RowDescription {
        fields: Vec<FieldDescription>,
    },
    DataRow {
        values: Vec<Option<Bytes>>,
    },
    CommandComplete {
        tag: String,
    },
    EmptyQueryResponse,

    // Extended query protocol
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    ParameterDescription {
        type_oids: Vec<Oid>,
    },

    // COPY sub-protocol
    CopyInResponse {
        format: Format,
        column_formats: Vec<Format>,
    },
    CopyOutResponse {
        format: Format,
        column_formats: Vec<Format>,
    },
    CopyData {
        data: Bytes,
    },
    CopyDone,

    // Status
    ReadyForQuery {
        status: TransactionStatus,
    },
    ParameterStatus {
        name: String,
        value: String,
    },
    BackendKeyData {
        process_id: i32,
        secret_key: i32,
    },
    NegotiateProtocolVersion {
        minor_version: i32,
        unrecognized: Vec<String>,
    },

    // Errors and notices
    ErrorResponse {
        fields: HashMap<u8, String>,
    },
    NoticeResponse {
        fields: HashMap<u8, String>,
    },

    // Other
    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
}

impl BackendMessage {
    /// Decode the body of one framed message.
    ///
    /// The body must be consumed exactly; leftover or missing bytes mean the
    /// stream is out of sync and are reported as protocol errors.
    pub fn decode(tag: u8, body: Bytes) -> PgResult<Self> {
        let mut body = Body { tag, buf: body };
        let msg = match tag {
            b'R' => Self::decode_auth(&mut body)?,
            b'T' => Self::decode_row_description(&mut body)?,
            b'D' => Self::decode_data_row(&mut body)?,
            b'C' => BackendMessage::CommandComplete {
                tag: body.cstring()?,
            },
            b'Z' => BackendMessage::ReadyForQuery {
                status: TransactionStatus::try_from(body.u8()?)?,
            },
            b'E' => BackendMessage::ErrorResponse {
                fields: body.error_fields()?,
            },
            b'N' => BackendMessage::NoticeResponse {
                fields: body.error_fields()?,
            },
            b'S' => BackendMessage::ParameterStatus {
                name: body.cstring()?,
                value: body.cstring()?,
            },
            b'K' => BackendMessage::BackendKeyData {
                process_id: body.i32()?,
                secret_key: body.i32()?,
            },
            b'v' => Self::decode_negotiate_protocol_version(&mut body)?,
            b'1' => BackendMessage::ParseComplete,
            b'2' => BackendMessage::BindComplete,
            b'3' => BackendMessage::CloseComplete,
            b'I' => BackendMessage::EmptyQueryResponse,
            b'n' => BackendMessage::NoData,
            b's' => BackendMessage::PortalSuspended,
            b't' => Self::decode_parameter_description(&mut body)?,
            b'A' => BackendMessage::NotificationResponse {
                process_id: body.i32()?,
                channel: body.cstring()?,
                payload: body.cstring()?,
            },
            b'G' => {
                let (format, column_formats) = Self::decode_copy_response(&mut body)?;
                BackendMessage::CopyInResponse {
                    format,
                    column_formats,
                }
            }
            b'H' => {
                let (format, column_formats) = Self::decode_copy_response(&mut body)?;
                BackendMessage::CopyOutResponse {
                    format,
                    column_formats,
                }
            }
            b'd' => BackendMessage::CopyData { data: body.rest() },
            b'c' => BackendMessage::CopyDone,
            _ => {
                return Err(PgError::protocol(format!(
                    "unknown message type {:?}",
                    tag as char
                )))
            }
        };
        body.finish()?;
        Ok(msg)
    }

    fn decode_auth(body: &mut Body) -> PgResult<Self> {
        let auth_type = body.i32()?;

        Ok(match auth_type {
            0 => BackendMessage::AuthenticationOk,
            3 => BackendMessage::AuthenticationCleartextPassword,
            5 => {
                let mut salt = [0u8; 4];
                salt.copy_from_slice(&body.bytes(4)?);
                BackendMessage::AuthenticationMD5Password { salt }
            }
            10 => {
                let mut mechanisms = Vec::new();
                loop {
                    let mech = body.cstring()?;
                    if mech.is_empty() {
                        break;
                    }
                    mechanisms.push(mech);
                }
                BackendMessage::AuthenticationSASL { mechanisms }
            }
            11 => BackendMessage::AuthenticationSASLContinue { data: body.rest() },
            12 => BackendMessage::AuthenticationSASLFinal { data: body.rest() },
            code => {
                // GSS continuation data and the like are not interpreted
                body.rest();
                BackendMessage::AuthenticationOther { code }
            }
        })
    }

    fn decode_row_description(body: &mut Body) -> PgResult<Self> {
        let num_fields = body.count()?;
        let mut fields = Vec::with_capacity(num_fields);

        for _ in 0..num_fields {
            fields.push(FieldDescription {
                name: body.cstring()?,
                table_oid: body.i32()?,
                column_attr: body.i16()?,
                type_oid: Oid::from_i32(body.i32()?),
                type_size: body.i16()?,
                type_modifier: body.i32()?,
                format: Format::from_i16(body.i16()?)?,
            });
        }

        Ok(BackendMessage::RowDescription { fields })
    }

    fn decode_data_row(body: &mut Body) -> PgResult<Self> {
        let num_cols = body.count()?;
        let mut values = Vec::with_capacity(num_cols);

        for _ in 0..num_cols {
            let len = body.i32()?;
            if len < 0 {
                values.push(None);
            } else {
                values.push(Some(body.bytes(len as usize)?));
            }
        }

        Ok(BackendMessage::DataRow { values })
    }

    fn decode_parameter_description(body: &mut Body) -> PgResult<Self> {
        let num_params = body.count()?;
        let mut type_oids = Vec::with_capacity(num_params);
        for _ in 0..num_params {
            type_oids.push(Oid::from_i32(body.i32()?));
        }
        Ok(BackendMessage::ParameterDescription { type_oids })
    }

    fn decode_copy_response(body: &mut Body) -> PgResult<(Format, Vec<Format>)> {
        let format = Format::from_i16(body.u8()? as i16)?;
        let num_cols = body.count()?;
        let mut column_formats = Vec::with_capacity(num_cols);
        for _ in 0..num_cols {
            column_formats.push(Format::from_i16(body.i16()?)?);
        }
        Ok((format, column_formats))
    }

    fn decode_negotiate_protocol_version(body: &mut Body) -> PgResult<Self> {
        let minor_version = body.i32()?;
        let count = body.i32()?.max(0);
        let mut unrecognized = Vec::new();
        for _ in 0..count {
            unrecognized.push(body.cstring()?);
        }
        Ok(BackendMessage::NegotiateProtocolVersion {
            minor_version,
            unrecognized,
        })
    }

    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            BackendMessage::AuthenticationOk => "AuthenticationOk",
            BackendMessage::AuthenticationCleartextPassword => "AuthenticationCleartextPassword",
            BackendMessage::AuthenticationMD5Password { .. } => "AuthenticationMD5Password",
            BackendMessage::AuthenticationSASL { .. } => "AuthenticationSASL",
            BackendMessage::AuthenticationSASLContinue { .. } => "AuthenticationSASLContinue",
            BackendMessage::AuthenticationSASLFinal { .. } => "AuthenticationSASLFinal",
            BackendMessage::AuthenticationOther { .. } => "Authentication",
            BackendMessage::RowDescription { .. } => "RowDescription",
            BackendMessage::DataRow { .. } => "DataRow",
            BackendMessage::CommandComplete { .. } => "CommandComplete",
            BackendMessage::EmptyQueryResponse => "EmptyQueryResponse",
            BackendMessage::ParseComplete => "ParseComplete",
            BackendMessage::BindComplete => "BindComplete",
            BackendMessage::CloseComplete => "CloseComplete",
            BackendMessage::NoData => "NoData",
            BackendMessage::PortalSuspended => "PortalSuspended",
            BackendMessage::ParameterDescription { .. } => "ParameterDescription",
            BackendMessage::CopyInResponse { .. } => "CopyInResponse",
            BackendMessage::CopyOutResponse { .. } => "CopyOutResponse",
            BackendMessage::CopyData { .. } => "CopyData",
            BackendMessage::CopyDone => "CopyDone",
            BackendMessage::ReadyForQuery { .. } => "ReadyForQuery",
            BackendMessage::ParameterStatus { .. } => "ParameterStatus",
            BackendMessage::BackendKeyData { .. } => "BackendKeyData",
            BackendMessage::NegotiateProtocolVersion { .. } => "NegotiateProtocolVersion",
            BackendMessage::ErrorResponse { .. } => "ErrorResponse",
            BackendMessage::NoticeResponse { .. } => "NoticeResponse",
            BackendMessage::NotificationResponse { .. } => "NotificationResponse",
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Bounds-checked reader over one message body.
struct Body {
    tag: u8,
    buf: Bytes,
}

impl Body {
    fn need(&self, n: usize) -> PgResult<()> {
        if self.buf.remaining() < n {
            return Err(PgError::protocol(format!(
                "truncated {:?} message",
                self.tag as char
            )));
        }
        Ok(())
    }

    fn u8(&mut self) -> PgResult<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn i16(&mut self) -> PgResult<i16> {
        self.need(2)?;
        Ok(self.buf.get_i16())
    }

    fn i32(&mut self) -> PgResult<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    /// An i16 element count; negative counts are rejected.
    fn count(&mut self) -> PgResult<usize> {
        let n = self.i16()?;
        usize::try_from(n).map_err(|_| PgError::protocol(format!("negative count {}", n)))
    }

    fn bytes(&mut self, n: usize) -> PgResult<Bytes> {
        self.need(n)?;
        Ok(self.buf.split_to(n))
    }

    fn rest(&mut self) -> Bytes {
        self.buf.split_off(0)
    }

    /// Read a null-terminated string from the buffer.
    /// Tries direct UTF-8 first, falls back to lossy only if invalid.
    fn cstring(&mut self) -> PgResult<String> {
        let end = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| PgError::protocol("missing null terminator in string"))?;

        let s = std::str::from_utf8(&self.buf[..end])
            .map(|s| s.to_owned())
            .unwrap_or_else(|_| String::from_utf8_lossy(&self.buf[..end]).into_owned());

        self.buf.advance(end + 1);
        Ok(s)
    }

    /// Read error/notice response fields
    fn error_fields(&mut self) -> PgResult<HashMap<u8, String>> {
        let mut fields = HashMap::new();
        loop {
            let field_type = self.u8()?;
            if field_type == 0 {
                break;
            }
            fields.insert(field_type, self.cstring()?);
        }
        Ok(fields)
    }

    fn finish(self) -> PgResult<()> {
        if self.buf.has_remaining() {
            return Err(PgError::protocol(format!(
                "{} unexpected trailing bytes in {:?} message",
                self.buf.remaining(),
                self.tag as char
            )));
        }
        Ok(())
    }
}
