//! Cursors.
//!
//! A cursor runs statements on its connection and holds the decoded rows of
//! the last one. Rows are materialized when the statement completes, so a
//! cursor keeps its results while other cursors use the same connection.

use std::collections::VecDeque;
use std::io::{Read, Write};

use super::connection::Connection;
use super::copy::{CopySpec, CopyStream};
use super::error::{PgError, PgResult};
use super::query::QueryResult;
use super::rewriter::Params;
use super::types::{Oid, PgValue};

/// Description of one result column, in DB-API 7-item order. Only `name`
/// and `type_code` are known from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub type_code: Oid,
    pub display_size: Option<i32>,
    pub internal_size: Option<i32>,
    pub precision: Option<i32>,
    pub scale: Option<i32>,
    pub null_ok: Option<bool>,
}

pub type Row = Vec<PgValue>;

#[derive(Debug)]
pub struct Cursor {
    connection: Option<Connection>,
    /// Default batch for [`fetchmany`](Self::fetchmany)
    pub arraysize: usize,
    rowcount: i64,
    description: Option<Vec<Column>>,
    rows: VecDeque<Row>,
    executed: bool,
}

impl Cursor {
    pub(crate) fn new(connection: Connection) -> Self {
        Self {
            connection: Some(connection),
            arraysize: 1,
            rowcount: -1,
            description: None,
            rows: VecDeque::new(),
            executed: false,
        }
    }

    fn conn(&self) -> PgResult<&Connection> {
        self.connection.as_ref().ok_or(PgError::CursorClosed)
    }

    /// The connection this cursor runs on.
    pub fn connection(&self) -> PgResult<&Connection> {
        self.conn()
    }

    /// Rows returned or affected by the last execute; -1 if unknown.
    pub fn rowcount(&self) -> i64 {
        self.rowcount
    }

    /// Result columns of the last statement, `None` if it returns no rows.
    pub fn description(&self) -> Option<&[Column]> {
        self.description.as_deref()
    }

    /// Execute one statement.
    ///
    /// Outside autocommit a transaction is opened first if none is active.
    pub fn execute(&mut self, query: &str, params: impl Into<Params>) -> PgResult<&mut Self> {
        self.run(query, params.into(), CopyStream::None)?;
        Ok(self)
    }

    /// Execute `query` once per parameter set. `rowcount` becomes the sum,
    /// or -1 if any execution had no count.
    pub fn executemany<I, P>(&mut self, query: &str, param_sets: I) -> PgResult<&mut Self>
    where
        I: IntoIterator<Item = P>,
        P: Into<Params>,
    {
        let mut total = Some(0i64);
        for params in param_sets {
            self.run(query, params.into(), CopyStream::None)?;
            total = total.and_then(|sum| (self.rowcount >= 0).then(|| sum + self.rowcount));
        }
        self.rowcount = total.unwrap_or(-1);
        Ok(self)
    }

    /// COPY out to `sink`. Returns the number of rows copied.
    pub fn copy_to(&mut self, sink: &mut dyn Write, spec: &CopySpec) -> PgResult<i64> {
        let sql = spec.to_sql("TO STDOUT")?;
        self.run(&sql, Params::None, CopyStream::Out(sink))?;
        Ok(self.rowcount)
    }

    /// COPY in from `source`. Returns the number of rows copied.
    pub fn copy_from(&mut self, source: &mut dyn Read, spec: &CopySpec) -> PgResult<i64> {
        let sql = spec.to_sql("FROM STDIN")?;
        self.run(&sql, Params::None, CopyStream::In(source))?;
        Ok(self.rowcount)
    }

    /// Execute a statement that may be a COPY, with the stream it needs.
    pub fn execute_with_stream(
        &mut self,
        query: &str,
        params: impl Into<Params>,
        mut stream: CopyStream<'_>,
    ) -> PgResult<&mut Self> {
        let params = params.into();
        self.run_with(query, params, &mut stream)?;
        Ok(self)
    }

    fn run(&mut self, query: &str, params: Params, mut stream: CopyStream<'_>) -> PgResult<()> {
        self.run_with(query, params, &mut stream)
    }

    fn run_with(
        &mut self,
        query: &str,
        params: Params,
        stream: &mut CopyStream<'_>,
    ) -> PgResult<()> {
        let result = {
            let conn = self.conn()?;
            let mut inner = conn.lock()?;
            inner
                .begin_if_needed()
                .and_then(|()| inner.execute(query, params, stream))
        };
        // A failed statement leaves nothing to fetch
        self.rows.clear();
        self.description = None;
        self.rowcount = -1;
        self.executed = true;
        self.load(result?);
        Ok(())
    }

    fn load(&mut self, result: QueryResult) {
        self.description = result.columns.map(|columns| {
            columns
                .iter()
                .map(|field| Column {
                    name: field.name.clone(),
                    type_code: field.type_oid,
                    display_size: None,
                    internal_size: None,
                    precision: None,
                    scale: None,
                    null_ok: None,
                })
                .collect()
        });
        self.rowcount = result.row_count;
        self.rows = result.rows.into();
    }

    fn check_fetch(&self) -> PgResult<()> {
        self.conn()?;
        if !self.executed {
            return Err(PgError::programming("attempting to use unexecuted cursor"));
        }
        if self.description.is_none() {
            return Err(PgError::programming("no result set"));
        }
        Ok(())
    }

    /// The next row, or `None` when exhausted.
    pub fn fetchone(&mut self) -> PgResult<Option<Row>> {
        self.check_fetch()?;
        Ok(self.rows.pop_front())
    }

    /// Up to `n` rows (`arraysize` when `None`); fewer only once exhausted.
    pub fn fetchmany(&mut self, n: Option<usize>) -> PgResult<Vec<Row>> {
        self.check_fetch()?;
        let n = n.unwrap_or(self.arraysize).min(self.rows.len());
        Ok(self.rows.drain(..n).collect())
    }

    /// Every remaining row.
    pub fn fetchall(&mut self) -> PgResult<Vec<Row>> {
        self.check_fetch()?;
        Ok(self.rows.drain(..).collect())
    }

    /// Iterate over the remaining rows.
    pub fn rows(&mut self) -> PgResult<impl Iterator<Item = Row> + '_> {
        self.check_fetch()?;
        Ok(self.rows.drain(..))
    }

    pub fn setinputsizes(&mut self, _sizes: &[Option<Oid>]) {}

    pub fn setoutputsize(&mut self, _size: usize, _column: Option<usize>) {}

    /// Detach from the connection. Later calls fail with `InterfaceError`.
    pub fn close(&mut self) -> PgResult<()> {
        self.conn()?;
        self.connection = None;
        self.rows.clear();
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_none()
    }
}
