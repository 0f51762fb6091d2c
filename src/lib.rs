//! pgproto - a synchronous PostgreSQL driver speaking the wire protocol directly.
//!
//! ```no_run
//! use pgproto::{Connection, PgConfig};
//!
//! # fn main() -> pgproto::PgResult<()> {
//! let conn = Connection::connect(PgConfig::from_url("postgresql://postgres:pw@localhost/app")?)?;
//! let mut cursor = conn.cursor();
//! cursor.execute("SELECT :1::int + 1", [41])?;
//! let row = cursor.fetchone()?;
//! conn.commit()?;
//! # Ok(())
//! # }
//! ```

pub mod pg;

pub use pg::*;
