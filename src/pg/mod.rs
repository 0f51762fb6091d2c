//! PostgreSQL frontend/backend protocol (v3) client.
//!
//! This module provides a blocking PostgreSQL driver that:
//! - Speaks the extended query protocol with binary parameters and results
//! - Caches prepared statements per connection
//! - Rewrites several placeholder styles to `$n`
//! - Streams COPY IN / COPY OUT
//!
//! Architecture:
//! - `framer` / `protocol`: wire framing and message encoding/decoding
//! - `transport`: TCP / unix sockets and the TLS upgrade seam
//! - `connection`: handshake state machine and the shared session
//! - `query` / `copy`: the exchange engine
//! - `cursor`: DB-API style result access
//! - `types`: value model and codec registry
//! - `rewriter`: paramstyle handling
//! - `statement`: prepared statement cache

pub mod config;
pub mod connection;
pub mod copy;
pub mod cursor;
pub mod error;
pub mod framer;
pub mod protocol;
pub mod query;
pub mod rewriter;
pub mod scram;
pub mod statement;
pub mod transport;
pub mod types;

#[cfg(test)]
mod tests;

pub use config::{PgConfig, SslMode};
pub use connection::{CancelToken, Connection, Notification, Xid};
pub use copy::{CopySpec, CopyStream};
pub use cursor::{Column, Cursor, Row};
pub use error::{ErrorKind, ErrorKinds, PgError, PgResult, ServerError};
pub use protocol::TransactionStatus;
pub use query::QueryResult;
pub use rewriter::{ParamStyle, Params};
pub use transport::{TlsConnector, Transport};
pub use types::{Inet, Interval, Numeric, Oid, PgValue, TypeOverrides, ValueKind};
