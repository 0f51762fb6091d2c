//! Query execution.
//!
//! Extended protocol, two round trips per uncached statement:
//!
//! ```text
//! [Close S]* Parse Describe(S) Sync  ->  ParseComplete ParameterDescription
//!                                        RowDescription|NoData ReadyForQuery
//! Bind Execute Sync                  ->  BindComplete DataRow* CommandComplete
//!                                        ReadyForQuery
//! ```
//!
//! A cached statement skips the first round trip. Every exchange reads up to
//! its ReadyForQuery even after an ErrorResponse, so framing survives errors;
//! the first error seen is the one returned.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};

use super::connection::ConnectionInner;
use super::copy::CopyStream;
use super::error::{PgError, PgResult};
use super::protocol::*;
use super::rewriter::Params;
use super::statement::{PreparedStatement, SharedColumns, StatementKey};
use super::types::{registry, EncodedParam, PgValue};

/// SQLSTATEs that mean a cached statement no longer matches the schema.
const STALE_PLAN_SQLSTATES: &[&str] = &["0A000", "26000"];

/// Parse and Bind carry their parameter counts as unsigned 16-bit integers.
const MAX_BIND_PARAMS: usize = u16::MAX as usize;

/// Commands whose tag ends in a row count.
const COUNTED_COMMANDS: &[&str] = &[
    "INSERT", "DELETE", "UPDATE", "SELECT", "MOVE", "FETCH", "COPY", "MERGE",
];

/// Commands after which cached statements may describe stale shapes.
const SCHEMA_COMMANDS: &[&str] = &["ALTER", "CREATE", "DROP"];

/// Where a connection is within one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Idle,
    Parsed,
    Bound,
    Executing,
    Synced,
}

// ============================================================================
// Query Result
// ============================================================================

/// Result of one statement.
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// `None` when the statement returns no rows
    pub columns: Option<SharedColumns>,
    pub rows: Vec<Vec<PgValue>>,
    /// Affected or returned rows; -1 when the server reported none
    pub row_count: i64,
    /// Command tag (e.g., "SELECT 5" or "INSERT 0 1")
    pub command_tag: Option<String>,
}

impl QueryResult {
    pub(crate) fn new() -> Self {
        Self {
            columns: None,
            rows: Vec::new(),
            row_count: -1,
            command_tag: None,
        }
    }
}

/// Row count carried by a CommandComplete tag, if its command has one.
pub(crate) fn row_count_from_tag(tag: &str) -> Option<i64> {
    let command = tag.split(' ').next()?;
    if !COUNTED_COMMANDS.contains(&command) {
        return None;
    }
    tag.rsplit(' ').next()?.parse().ok()
}

fn changes_schema(tag: &str) -> bool {
    tag.split(' ')
        .next()
        .is_some_and(|command| SCHEMA_COMMANDS.contains(&command))
}

fn is_stale_plan(err: &PgError) -> bool {
    err.sqlstate()
        .is_some_and(|code| STALE_PLAN_SQLSTATES.contains(&code))
}

/// Remember `err` unless an earlier error is already waiting.
pub(crate) fn keep_first(slot: &mut Option<PgError>, err: PgError) {
    if slot.is_none() {
        *slot = Some(err);
    }
}

fn check_query_text(query: &str) -> PgResult<()> {
    if query.contains('\0') {
        return Err(PgError::interface("query string contains a NUL character"));
    }
    Ok(())
}

// ============================================================================
// Engine
// ============================================================================

impl ConnectionInner {
    fn set_exchange(&mut self, state: ExchangeState) {
        trace!(?state, "exchange");
        self.exchange = state;
    }

    fn ready(&mut self, status: TransactionStatus) {
        self.transaction_status = status;
        self.set_exchange(ExchangeState::Synced);
        self.set_exchange(ExchangeState::Idle);
    }

    /// Run `query` with `params` through the extended protocol.
    pub(crate) fn execute(
        &mut self,
        query: &str,
        params: Params,
        copy: &mut CopyStream<'_>,
    ) -> PgResult<QueryResult> {
        self.ensure_open()?;
        check_query_text(query)?;

        let rewritten = self.rewrites.rewrite(query, self.paramstyle)?;
        let args = rewritten.mapping.apply(params)?;
        if args.len() > MAX_BIND_PARAMS {
            return Err(PgError::interface(format!(
                "{} parameters given, at most {} are supported",
                args.len(),
                MAX_BIND_PARAMS
            )));
        }
        // Encoding happens before anything is written, so a failing value
        // (or hook) leaves the session untouched.
        let encoded = args
            .iter()
            .map(|value| self.overrides.encode(registry(), value))
            .collect::<PgResult<Vec<_>>>()?;
        let key = StatementKey::new(
            rewritten.query.clone(),
            encoded.iter().map(|p| p.oid).collect(),
        );

        let mut retried = false;
        loop {
            match self.run_extended(&key, &encoded, copy) {
                Err(err) if is_stale_plan(&err) => {
                    self.evict(&key);
                    if retried || self.closed || self.in_transaction() {
                        return Err(err);
                    }
                    debug!(sqlstate = ?err.sqlstate(), "prepared statement went stale, preparing again");
                    retried = true;
                }
                other => return other,
            }
        }
    }

    fn run_extended(
        &mut self,
        key: &StatementKey,
        params: &[EncodedParam],
        copy: &mut CopyStream<'_>,
    ) -> PgResult<QueryResult> {
        self.buffer_pending_closes();
        let statement = match self.statement_cache.get(key) {
            Some(statement) => statement,
            None => self.prepare(key)?,
        };
        self.bind_and_execute(&statement, params, copy)
    }

    fn evict(&mut self, key: &StatementKey) {
        if let Some(statement) = self.statement_cache.remove(key) {
            self.pending_close.push(statement.name.clone());
        }
    }

    fn buffer_pending_closes(&mut self) {
        for name in std::mem::take(&mut self.pending_close) {
            trace!(%name, "closing evicted statement");
            self.framer.buffer(&CloseMessage {
                target: Target::Statement,
                name,
            });
        }
    }

    /// Parse and describe a statement, then cache it.
    fn prepare(&mut self, key: &StatementKey) -> PgResult<Arc<PreparedStatement>> {
        let name = self.statement_cache.next_statement_name();
        self.framer.buffer(&ParseMessage {
            name: name.clone(),
            query: key.query.clone(),
            param_types: key.param_oids.clone(),
        });
        self.framer.buffer(&DescribeMessage {
            target: Target::Statement,
            name: name.clone(),
        });
        self.framer.buffer(&SyncMessage);
        self.flush()?;
        self.set_exchange(ExchangeState::Parsed);

        let mut param_types = key.param_oids.clone();
        let mut columns = Vec::new();
        let mut error = None;
        loop {
            match self.receive()? {
                BackendMessage::ParseComplete
                | BackendMessage::CloseComplete
                | BackendMessage::NoData => {}
                BackendMessage::ParameterDescription { type_oids } => param_types = type_oids,
                BackendMessage::RowDescription { fields } => columns = fields,
                BackendMessage::ErrorResponse { fields } => {
                    keep_first(&mut error, PgError::from_fields(fields))
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.ready(status);
                    break;
                }
                other => return Err(self.unexpected(&other, "prepare")),
            }
        }
        if let Some(err) = error {
            return Err(err);
        }

        let statement = Arc::new(PreparedStatement::new(name, param_types, columns));
        if let Some(evicted) = self
            .statement_cache
            .insert(key.clone(), Arc::clone(&statement))
        {
            debug!(%evicted, "statement cache full, evicting");
            self.pending_close.push(evicted);
        }
        Ok(statement)
    }

    fn bind_and_execute(
        &mut self,
        statement: &PreparedStatement,
        params: &[EncodedParam],
        copy: &mut CopyStream<'_>,
    ) -> PgResult<QueryResult> {
        let formats: Vec<Format> = statement
            .columns
            .iter()
            .map(|column| {
                self.overrides
                    .result_format(registry(), column.type_oid, self.binary_results)
            })
            .collect();

        self.framer.buffer(&BindMessage {
            portal: String::new(),
            statement: statement.name.clone(),
            params: params.to_vec(),
            result_formats: formats.clone(),
        });
        self.framer.buffer(&ExecuteMessage {
            portal: String::new(),
            max_rows: 0,
        });
        self.framer.buffer(&SyncMessage);
        self.flush()?;
        self.set_exchange(ExchangeState::Bound);

        let mut result = QueryResult::new();
        if statement.returns_rows() {
            result.columns = Some(Arc::clone(&statement.columns));
        }
        let mut error = None;
        loop {
            match self.receive()? {
                BackendMessage::BindComplete | BackendMessage::CloseComplete => {
                    self.set_exchange(ExchangeState::Executing);
                }
                BackendMessage::DataRow { values } => {
                    if error.is_none() {
                        match self.decode_row(&values, &statement.columns, &formats) {
                            Ok(row) => result.rows.push(row),
                            Err(e) => error = Some(e),
                        }
                    }
                }
                BackendMessage::CommandComplete { tag } => self.command_complete(&mut result, tag),
                BackendMessage::EmptyQueryResponse => {
                    keep_first(&mut error, PgError::programming("query was empty"))
                }
                // Only with a row limit, which is never requested
                BackendMessage::PortalSuspended => {}
                BackendMessage::CopyOutResponse { .. } => self.copy_out_started(copy, &mut error),
                BackendMessage::CopyData { data } => self.copy_data(copy, data, &mut error),
                BackendMessage::CopyDone => {}
                BackendMessage::CopyInResponse { .. } => self.copy_in(copy, &mut error, true)?,
                BackendMessage::ErrorResponse { fields } => {
                    keep_first(&mut error, PgError::from_fields(fields))
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.ready(status);
                    break;
                }
                other => return Err(self.unexpected(&other, "execute")),
            }
        }
        match error {
            Some(err) => Err(err),
            None => Ok(result),
        }
    }

    /// Run `sql` through the simple query protocol.
    pub(crate) fn simple_query(&mut self, sql: &str) -> PgResult<Vec<QueryResult>> {
        self.ensure_open()?;
        check_query_text(sql)?;

        self.framer.buffer(&QueryMessage {
            query: sql.to_string(),
        });
        self.flush()?;
        self.set_exchange(ExchangeState::Executing);

        let mut results = Vec::new();
        let mut current = QueryResult::new();
        let mut formats = Vec::new();
        let mut copy = CopyStream::None;
        let mut error = None;
        loop {
            match self.receive()? {
                BackendMessage::RowDescription { fields } => {
                    formats = fields.iter().map(|f| f.format).collect();
                    current.columns = Some(Arc::new(fields));
                }
                BackendMessage::DataRow { values } => {
                    if error.is_none() {
                        let columns = current.columns.clone().unwrap_or_default();
                        match self.decode_row(&values, &columns, &formats) {
                            Ok(row) => current.rows.push(row),
                            Err(e) => error = Some(e),
                        }
                    }
                }
                BackendMessage::CommandComplete { tag } => {
                    self.command_complete(&mut current, tag);
                    results.push(std::mem::replace(&mut current, QueryResult::new()));
                }
                BackendMessage::EmptyQueryResponse => {}
                BackendMessage::CopyOutResponse { .. } => {
                    self.copy_out_started(&mut copy, &mut error)
                }
                BackendMessage::CopyData { data } => self.copy_data(&mut copy, data, &mut error),
                BackendMessage::CopyDone => {}
                BackendMessage::CopyInResponse { .. } => {
                    self.copy_in(&mut copy, &mut error, false)?
                }
                BackendMessage::ErrorResponse { fields } => {
                    keep_first(&mut error, PgError::from_fields(fields))
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.ready(status);
                    break;
                }
                other => return Err(self.unexpected(&other, "simple query")),
            }
        }
        match error {
            Some(err) => Err(err),
            None => Ok(results),
        }
    }

    fn command_complete(&mut self, result: &mut QueryResult, tag: String) {
        if let Some(count) = row_count_from_tag(&tag) {
            result.row_count = result.row_count.max(0) + count;
        }
        if changes_schema(&tag) && !self.statement_cache.is_empty() {
            let names = self.statement_cache.clear();
            debug!(count = names.len(), %tag, "schema changed, dropping cached statements");
            self.pending_close.extend(names);
        }
        result.command_tag = Some(tag);
    }

    fn decode_row(
        &self,
        values: &[Option<Bytes>],
        columns: &[FieldDescription],
        formats: &[Format],
    ) -> PgResult<Vec<PgValue>> {
        if values.len() != columns.len() || values.len() != formats.len() {
            return Err(PgError::decode(format!(
                "row has {} values for {} columns",
                values.len(),
                columns.len()
            )));
        }
        values
            .iter()
            .zip(columns.iter().zip(formats))
            .map(|(value, (column, format))| match value {
                Some(data) => self
                    .overrides
                    .decode(registry(), column.type_oid, *format, data),
                None => Ok(PgValue::Null),
            })
            .collect()
    }
}
