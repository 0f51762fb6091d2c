//! PostgreSQL error types.
//!
//! Every failure the driver can report is a [`PgError`]. Each error carries an
//! [`ErrorKind`] from the fixed DB-API hierarchy:
//!
//! ```text
//! Warning
//! InterfaceError
//! DatabaseError
//!  ├── OperationalError
//!  ├── IntegrityError
//!  ├── InternalError
//!  ├── ProgrammingError
//!  └── NotSupportedError
//! ```
//!
//! Server `ErrorResponse` messages are mapped to a kind by SQLSTATE class.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

/// Boxed error returned by user-supplied conversion hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for PostgreSQL operations.
pub type PgResult<T> = Result<T, PgError>;

// ============================================================================
// Error Kinds
// ============================================================================

/// The fixed error taxonomy exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Non-fatal notice; never returned as an `Err`.
    Warning,
    /// Client or transport level failure.
    InterfaceError,
    /// Base of all server-side errors.
    DatabaseError,
    /// Resource or connectivity failure while serving a valid request.
    OperationalError,
    /// Constraint violation.
    IntegrityError,
    /// Server-reported internal error.
    InternalError,
    /// Bad SQL, bad object name, bad credentials.
    ProgrammingError,
    /// Feature not supported by this driver or server.
    NotSupportedError,
}

impl ErrorKind {
    /// Parent kind in the hierarchy, if any.
    pub fn parent(self) -> Option<ErrorKind> {
        match self {
            ErrorKind::OperationalError
            | ErrorKind::IntegrityError
            | ErrorKind::InternalError
            | ErrorKind::ProgrammingError
            | ErrorKind::NotSupportedError => Some(ErrorKind::DatabaseError),
            _ => None,
        }
    }

    /// Whether `self` is `other` or one of its subclasses.
    pub fn is_a(self, other: ErrorKind) -> bool {
        self == other || self.parent() == Some(other)
    }

    /// Map a five-character SQLSTATE to a kind by its class.
    pub fn from_sqlstate(code: &str) -> ErrorKind {
        match code.get(..2).unwrap_or("") {
            "08" | "40" | "53" | "57" | "58" => ErrorKind::OperationalError,
            "23" => ErrorKind::IntegrityError,
            "XX" => ErrorKind::InternalError,
            "0A" => ErrorKind::NotSupportedError,
            _ => ErrorKind::ProgrammingError,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Warning => "Warning",
            ErrorKind::InterfaceError => "InterfaceError",
            ErrorKind::DatabaseError => "DatabaseError",
            ErrorKind::OperationalError => "OperationalError",
            ErrorKind::IntegrityError => "IntegrityError",
            ErrorKind::InternalError => "InternalError",
            ErrorKind::ProgrammingError => "ProgrammingError",
            ErrorKind::NotSupportedError => "NotSupportedError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error kinds mirrored as associated constants on a type.
///
/// Implemented by [`Connection`](super::Connection) so callers can write
/// `err.is(Connection::INTEGRITY_ERROR)`.
pub trait ErrorKinds {
    const WARNING: ErrorKind = ErrorKind::Warning;
    const INTERFACE_ERROR: ErrorKind = ErrorKind::InterfaceError;
    const DATABASE_ERROR: ErrorKind = ErrorKind::DatabaseError;
    const OPERATIONAL_ERROR: ErrorKind = ErrorKind::OperationalError;
    const INTEGRITY_ERROR: ErrorKind = ErrorKind::IntegrityError;
    const INTERNAL_ERROR: ErrorKind = ErrorKind::InternalError;
    const PROGRAMMING_ERROR: ErrorKind = ErrorKind::ProgrammingError;
    const NOT_SUPPORTED_ERROR: ErrorKind = ErrorKind::NotSupportedError;
}

// ============================================================================
// Server Errors
// ============================================================================

/// Fields of an `ErrorResponse` or `NoticeResponse`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerError {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<String>,
    pub where_: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub column: Option<String>,
    pub data_type: Option<String>,
    pub constraint: Option<String>,
    pub file: Option<String>,
    pub line: Option<String>,
    pub routine: Option<String>,
}

impl ServerError {
    /// Build from the raw field map keyed by field type byte.
    pub fn from_fields(mut fields: HashMap<u8, String>) -> Self {
        // 'V' is the non-localized severity (9.6+); prefer it when present.
        let severity = fields
            .remove(&b'V')
            .or_else(|| fields.remove(&b'S'))
            .unwrap_or_default();
        Self {
            severity,
            code: fields.remove(&b'C').unwrap_or_default(),
            message: fields.remove(&b'M').unwrap_or_default(),
            detail: fields.remove(&b'D'),
            hint: fields.remove(&b'H'),
            position: fields.remove(&b'P'),
            where_: fields.remove(&b'W'),
            schema: fields.remove(&b's'),
            table: fields.remove(&b't'),
            column: fields.remove(&b'c'),
            data_type: fields.remove(&b'd'),
            constraint: fields.remove(&b'n'),
            file: fields.remove(&b'F'),
            line: fields.remove(&b'L'),
            routine: fields.remove(&b'R'),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        ErrorKind::from_sqlstate(&self.code)
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} (SQLSTATE {})", self.severity, self.message, self.code)?;
        if let Some(ref detail) = self.detail {
            write!(f, "\nDETAIL: {}", detail)?;
        }
        if let Some(ref hint) = self.hint {
            write!(f, "\nHINT: {}", hint)?;
        }
        Ok(())
    }
}

// ============================================================================
// PgError
// ============================================================================

/// PostgreSQL driver errors.
#[derive(Debug, Error)]
pub enum PgError {
    /// Transport failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing failure or an unexpected message; the connection is unusable.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Client-side authentication failure (unsupported method, bad SCRAM exchange).
    #[error("authentication error: {0}")]
    Auth(String),

    /// Other client-side misuse reported as an interface error.
    #[error("{0}")]
    Interface(String),

    /// Operation attempted on a closed connection.
    #[error("connection is closed")]
    ConnectionClosed,

    /// Operation attempted on a closed cursor.
    #[error("cursor is closed")]
    CursorClosed,

    /// Error reported by the server.
    #[error("{0}")]
    Server(Box<ServerError>),

    /// Client-side programming error (bad arguments, fetch without results).
    #[error("{0}")]
    Programming(String),

    /// A value or feature this driver cannot handle.
    #[error("{0}")]
    NotSupported(String),

    /// Malformed value bytes received from the server.
    #[error("decode error: {0}")]
    Decode(String),

    #[error("array has no values")]
    ArrayContentEmpty,

    #[error("array dimensions not consistent")]
    ArrayDimensionsNotConsistent,

    #[error("array content not homogeneous: {0}")]
    ArrayContentNotHomogeneous(String),

    #[error("array content not supported: {0}")]
    ArrayContentNotSupported(String),

    #[error("either a table or a query must be specified for COPY")]
    CopyQueryOrTableRequired,

    /// Reading the COPY source or writing the COPY sink failed.
    #[error("COPY stream error: {0}")]
    CopyStream(#[source] std::io::Error),

    /// Failure raised inside a user conversion hook, carried unchanged.
    #[error("{0}")]
    Hook(#[source] BoxError),
}

impl PgError {
    pub fn interface(msg: impl Into<String>) -> Self {
        PgError::Interface(msg.into())
    }

    pub fn programming(msg: impl Into<String>) -> Self {
        PgError::Programming(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        PgError::Protocol(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        PgError::Decode(msg.into())
    }

    pub(crate) fn from_fields(fields: HashMap<u8, String>) -> Self {
        PgError::Server(Box::new(ServerError::from_fields(fields)))
    }

    /// The taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PgError::Io(_)
            | PgError::Protocol(_)
            | PgError::Auth(_)
            | PgError::Interface(_)
            | PgError::ConnectionClosed
            | PgError::CursorClosed
            | PgError::Decode(_)
            | PgError::CopyStream(_)
            | PgError::Hook(_) => ErrorKind::InterfaceError,
            PgError::Server(err) => err.kind(),
            PgError::Programming(_)
            | PgError::ArrayContentEmpty
            | PgError::ArrayDimensionsNotConsistent
            | PgError::ArrayContentNotHomogeneous(_)
            | PgError::CopyQueryOrTableRequired => ErrorKind::ProgrammingError,
            PgError::NotSupported(_) | PgError::ArrayContentNotSupported(_) => {
                ErrorKind::NotSupportedError
            }
        }
    }

    /// Whether this error belongs to `kind` (honouring the hierarchy).
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind().is_a(kind)
    }

    /// Server error details, if the server reported this error.
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            PgError::Server(err) => Some(err),
            _ => None,
        }
    }

    /// SQLSTATE code, if the server reported this error.
    pub fn sqlstate(&self) -> Option<&str> {
        self.server_error().map(|e| e.code.as_str())
    }

    /// Borrow the original hook error as its concrete type.
    pub fn hook_error<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self {
            PgError::Hook(err) => err.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Recover the original hook error, or give back `self` if this is not one.
    pub fn into_hook_error(self) -> Result<BoxError, Self> {
        match self {
            PgError::Hook(err) => Ok(err),
            other => Err(other),
        }
    }

    /// Whether the transport is gone and the connection must be discarded.
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(
            self,
            PgError::Io(_) | PgError::Protocol(_) | PgError::ConnectionClosed
        )
    }
}
