//! COPY IN / COPY OUT.
//!
//! COPY runs through the ordinary execute path; the engine hands the
//! CopyInResponse / CopyOutResponse sub-exchanges to the functions here.
//! Without a matching stream the copy is still completed on the wire (data
//! discarded, or the upload failed with CopyFail) so the session stays usable.

use std::io::{self, Read, Write};

use bytes::Bytes;
use tracing::{debug, trace};

use super::connection::ConnectionInner;
use super::error::{PgError, PgResult};
use super::protocol::{CopyDataMessage, CopyDoneMessage, CopyFailMessage, SyncMessage};
use super::query::keep_first;

const COPY_CHUNK: usize = 8192;

/// The caller's end of a COPY.
pub enum CopyStream<'a> {
    None,
    /// Receives COPY TO STDOUT data
    Out(&'a mut dyn Write),
    /// Supplies COPY FROM STDIN data
    In(&'a mut dyn Read),
}

impl std::fmt::Debug for CopyStream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CopyStream::None => "CopyStream::None",
            CopyStream::Out(_) => "CopyStream::Out",
            CopyStream::In(_) => "CopyStream::In",
        })
    }
}

/// What to copy: a table, or a complete COPY statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopySpec {
    table: Option<String>,
    query: Option<String>,
    delimiter: Option<String>,
    null: Option<String>,
}

impl CopySpec {
    /// Copy a whole table. The name is used as written, so quote it if needed.
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: Some(table.into()),
            ..Self::default()
        }
    }

    /// Run a full `COPY ... TO STDOUT` / `COPY ... FROM STDIN` statement.
    pub fn query(query: impl Into<String>) -> Self {
        Self {
            query: Some(query.into()),
            ..Self::default()
        }
    }

    /// Column delimiter for the table form.
    pub fn delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = Some(delimiter.into());
        self
    }

    /// NULL marker for the table form.
    pub fn null(mut self, null: impl Into<String>) -> Self {
        self.null = Some(null.into());
        self
    }

    /// `COPY t TO STDOUT ...` / `COPY t FROM STDIN ...`.
    pub(crate) fn to_sql(&self, direction: &str) -> PgResult<String> {
        match (&self.table, &self.query) {
            (Some(table), None) => {
                let mut sql = format!("COPY {} {}", table, direction);
                if let Some(delimiter) = &self.delimiter {
                    sql.push_str(&format!(" DELIMITER {}", quote_literal(delimiter)));
                }
                if let Some(null) = &self.null {
                    sql.push_str(&format!(" NULL {}", quote_literal(null)));
                }
                Ok(sql)
            }
            (None, Some(query)) => Ok(query.clone()),
            _ => Err(PgError::CopyQueryOrTableRequired),
        }
    }
}

fn quote_literal(s: &str) -> String {
    if s.contains('\\') {
        format!("E'{}'", s.replace('\\', "\\\\").replace('\'', "''"))
    } else {
        format!("'{}'", s.replace('\'', "''"))
    }
}

impl ConnectionInner {
    pub(crate) fn copy_out_started(&mut self, copy: &mut CopyStream<'_>, error: &mut Option<PgError>) {
        trace!("copy out");
        if !matches!(copy, CopyStream::Out(_)) {
            keep_first(
                error,
                PgError::interface("An output stream is required for the COPY OUT response."),
            );
        }
    }

    pub(crate) fn copy_data(
        &mut self,
        copy: &mut CopyStream<'_>,
        data: Bytes,
        error: &mut Option<PgError>,
    ) {
        // After the first failure the rest of the data is drained and dropped
        if error.is_some() {
            return;
        }
        if let CopyStream::Out(sink) = copy {
            if let Err(e) = sink.write_all(&data) {
                *error = Some(PgError::CopyStream(e));
            }
        }
    }

    /// Upload the source as CopyData, then CopyDone; or CopyFail when there
    /// is no source or it fails. In the extended protocol the Sync that
    /// followed Execute was ignored during copy-in, so another one is sent.
    pub(crate) fn copy_in(
        &mut self,
        copy: &mut CopyStream<'_>,
        error: &mut Option<PgError>,
        extended: bool,
    ) -> PgResult<()> {
        trace!("copy in");
        let failure = match copy {
            CopyStream::In(source) => self.send_copy_data(&mut **source)?,
            _ => Some(PgError::interface(
                "An input stream is required for the COPY IN response.",
            )),
        };

        match failure {
            Some(err) => {
                debug!(error = %err, "aborting COPY FROM STDIN");
                self.framer.buffer(&CopyFailMessage {
                    reason: err.to_string(),
                });
                keep_first(error, err);
            }
            None => self.framer.buffer(&CopyDoneMessage),
        }
        if extended {
            self.framer.buffer(&SyncMessage);
        }
        self.flush()
    }

    /// Stream `source` to the server. Returns the source's error, if any;
    /// transport errors are returned as `Err`.
    fn send_copy_data(&mut self, source: &mut dyn Read) -> PgResult<Option<PgError>> {
        let mut chunk = vec![0u8; COPY_CHUNK];
        loop {
            let n = match source.read(&mut chunk) {
                Ok(0) => return Ok(None),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Ok(Some(PgError::CopyStream(e))),
            };
            self.framer.buffer(&CopyDataMessage { data: &chunk[..n] });
            self.flush()?;
        }
    }
}
