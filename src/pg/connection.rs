//! PostgreSQL connection.
//!
//! This module provides:
//! - Transport setup, SSL negotiation and the startup/authentication handshake
//! - The shared connection handle used by cursors
//! - Transactions, autocommit and two-phase commit
//! - Notification and notice queues
//! - Out-of-band query cancellation

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use super::config::{PgConfig, SslMode};
use super::cursor::Cursor;
use super::error::{ErrorKinds, PgError, PgResult, ServerError};
use super::framer::MessageFramer;
use super::protocol::*;
use super::query::{ExchangeState, QueryResult};
use super::rewriter::{ParamStyle, Params, RewriteCache};
use super::scram::{self, ScramClient};
use super::statement::StatementCache;
use super::transport::{Endpoint, TlsConnector, Transport};
use super::types::{PgValue, TypeOverrides};

/// Notices kept for [`Connection::notices`]; older ones are dropped.
const MAX_NOTICES: usize = 100;

const REWRITE_CACHE_CAPACITY: usize = 256;

// ============================================================================
// Notifications
// ============================================================================

/// A LISTEN/NOTIFY event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Backend process that sent the NOTIFY
    pub process_id: i32,
    pub channel: String,
    pub payload: String,
}

// ============================================================================
// Handshake
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    Unauthenticated,
    AuthRequested,
    Authenticated,
    Ready,
}

fn advance(state: &mut HandshakeState, next: HandshakeState) {
    if *state != next {
        debug!(from = ?*state, to = ?next, "handshake");
        *state = next;
    }
}

fn require_password(config: &PgConfig) -> PgResult<&str> {
    config.password.as_deref().ok_or_else(|| {
        PgError::interface(
            "server requesting password authentication, but no password was provided",
        )
    })
}

fn unsupported_auth(code: i32) -> PgError {
    let method = match code {
        2 => "Kerberos V5",
        4 => "crypt",
        6 => "SCM credential",
        7 => "GSSAPI",
        8 => "GSSAPI continue",
        9 => "SSPI",
        _ => {
            return PgError::interface(format!(
                "authentication method {} not recognized by pgproto",
                code
            ))
        }
    };
    PgError::interface(format!(
        "authentication method {} ({}) not supported by pgproto",
        code, method
    ))
}

/// Compute MD5 password hash.
fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    // MD5(MD5(password + user) + salt)
    let inner = format!("{}{}", password, user);
    let inner_hash = md5::compute(inner.as_bytes());

    let inner_hex = format!("{:x}", inner_hash);
    let mut hasher_input = inner_hex.into_bytes();
    hasher_input.extend_from_slice(salt);

    let outer_hash = md5::compute(&hasher_input);
    format!("md5{:x}", outer_hash)
}

/// Send an SSLRequest when a TLS upgrade is possible and act on the answer.
fn negotiate_ssl(
    config: &PgConfig,
    mut stream: Box<dyn Transport>,
    tls: Option<&dyn TlsConnector>,
) -> PgResult<Box<dyn Transport>> {
    let connector = match (config.ssl_mode, tls) {
        (SslMode::Disable, _) | (SslMode::Prefer, None) => return Ok(stream),
        (SslMode::Require, None) => {
            return Err(PgError::interface(
                "ssl_mode is require but no TLS connector was supplied",
            ))
        }
        (_, Some(connector)) => connector,
    };

    stream.write_all(&SslRequestMessage.encode())?;
    stream.flush()?;
    let mut answer = [0u8; 1];
    stream.read_exact(&mut answer)?;

    match answer[0] {
        b'S' => {
            debug!("server accepted SSL");
            connector
                .connect(&config.host, stream)
                .map_err(|e| PgError::interface(format!("TLS handshake failed: {}", e)))
        }
        b'N' if config.ssl_mode == SslMode::Require => {
            Err(PgError::interface("server refuses SSL"))
        }
        b'N' => {
            debug!("server refused SSL, continuing unencrypted");
            Ok(stream)
        }
        other => Err(PgError::protocol(format!(
            "unexpected response to SSLRequest: {:?}",
            other as char
        ))),
    }
}

// ============================================================================
// Connection state
// ============================================================================

/// Everything behind the connection lock.
pub(crate) struct ConnectionInner {
    pub(crate) framer: MessageFramer,
    pub(crate) statement_cache: StatementCache,
    /// Statements evicted locally that still exist on the server
    pub(crate) pending_close: Vec<String>,
    pub(crate) rewrites: RewriteCache,
    pub(crate) overrides: TypeOverrides,
    pub(crate) paramstyle: ParamStyle,
    pub(crate) binary_results: bool,
    pub(crate) transaction_status: TransactionStatus,
    pub(crate) exchange: ExchangeState,
    pub(crate) autocommit: bool,
    pub(crate) closed: bool,
    pub(crate) notifications: VecDeque<Notification>,
    pub(crate) notices: VecDeque<ServerError>,
    parameters: HashMap<String, String>,
    backend_pid: i32,
    backend_secret_key: i32,
    endpoint: Endpoint,
    timeout: Option<Duration>,
    xid: Option<Xid>,
}

impl ConnectionInner {
    fn new(framer: MessageFramer, config: &PgConfig) -> Self {
        Self {
            framer,
            statement_cache: StatementCache::new(config.statement_cache_capacity),
            pending_close: Vec::new(),
            rewrites: RewriteCache::new(REWRITE_CACHE_CAPACITY),
            overrides: TypeOverrides::new(),
            paramstyle: config.paramstyle,
            binary_results: config.binary_results,
            transaction_status: TransactionStatus::Idle,
            exchange: ExchangeState::Idle,
            autocommit: false,
            closed: false,
            notifications: VecDeque::new(),
            notices: VecDeque::new(),
            parameters: HashMap::new(),
            backend_pid: 0,
            backend_secret_key: 0,
            endpoint: Endpoint::from_config(config),
            timeout: config.timeout,
            xid: None,
        }
    }

    /// Perform the startup handshake (authentication).
    fn startup(&mut self, config: &PgConfig) -> PgResult<()> {
        let mut state = HandshakeState::Unauthenticated;
        self.framer.send(&StartupMessage {
            user: config.user.clone(),
            database: config.database.clone(),
            options: config.startup_params(),
        })?;

        loop {
            match self.receive()? {
                BackendMessage::AuthenticationOk => {
                    advance(&mut state, HandshakeState::Authenticated);
                }
                BackendMessage::AuthenticationCleartextPassword => {
                    advance(&mut state, HandshakeState::AuthRequested);
                    let password = require_password(config)?;
                    self.framer.send(&PasswordMessage {
                        password: password.to_string(),
                    })?;
                }
                BackendMessage::AuthenticationMD5Password { salt } => {
                    advance(&mut state, HandshakeState::AuthRequested);
                    let password = require_password(config)?;
                    self.framer.send(&PasswordMessage {
                        password: md5_password(&config.user, password, &salt),
                    })?;
                }
                BackendMessage::AuthenticationSASL { mechanisms } => {
                    advance(&mut state, HandshakeState::AuthRequested);
                    self.authenticate_sasl(config, &mechanisms)?;
                }
                BackendMessage::AuthenticationOther { code } => {
                    return Err(unsupported_auth(code));
                }
                BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                } => {
                    self.backend_pid = process_id;
                    self.backend_secret_key = secret_key;
                }
                BackendMessage::NegotiateProtocolVersion {
                    minor_version,
                    unrecognized,
                } => {
                    debug!(minor_version, ?unrecognized, "server negotiated protocol version");
                }
                BackendMessage::ReadyForQuery { status } if state == HandshakeState::Authenticated => {
                    self.transaction_status = status;
                    advance(&mut state, HandshakeState::Ready);
                    debug!(
                        pid = self.backend_pid,
                        server_version = self.parameters.get("server_version").map(String::as_str),
                        "connection ready"
                    );
                    return Ok(());
                }
                BackendMessage::ErrorResponse { fields } => {
                    return Err(PgError::from_fields(fields));
                }
                other => {
                    return Err(PgError::protocol(format!(
                        "unexpected {} message during startup",
                        other.name()
                    )))
                }
            }
        }
    }

    fn authenticate_sasl(&mut self, config: &PgConfig, mechanisms: &[String]) -> PgResult<()> {
        if !mechanisms.iter().any(|m| m == scram::MECHANISM) {
            return Err(PgError::Auth(format!(
                "none of the server's SASL mechanisms are supported: {}",
                mechanisms.join(", ")
            )));
        }
        let password = require_password(config)?;

        let mut client = ScramClient::new(&config.user, password);
        self.framer.send(&SaslInitialResponseMessage {
            mechanism: scram::MECHANISM.to_string(),
            data: client.client_first_message(),
        })?;

        loop {
            match self.receive()? {
                BackendMessage::AuthenticationSASLContinue { data } => {
                    let client_final = client
                        .process_server_first(&data)
                        .map_err(|e| PgError::Auth(e.to_string()))?;
                    self.framer.send(&SaslResponseMessage { data: client_final })?;
                }
                BackendMessage::AuthenticationSASLFinal { data } => {
                    client
                        .verify_server_final(&data)
                        .map_err(|e| PgError::Auth(e.to_string()))?;
                    return Ok(());
                }
                BackendMessage::ErrorResponse { fields } => {
                    return Err(PgError::from_fields(fields));
                }
                other => {
                    return Err(PgError::protocol(format!(
                        "unexpected {} message during SASL authentication",
                        other.name()
                    )))
                }
            }
        }
    }

    // ========================================================================
    // Message plumbing
    // ========================================================================

    /// Receive the next message that belongs to the current exchange.
    ///
    /// Notices, notifications and parameter changes can arrive at any point;
    /// they are absorbed here.
    pub(crate) fn receive(&mut self) -> PgResult<BackendMessage> {
        loop {
            let msg = match self.framer.receive_message() {
                Ok(msg) => msg,
                Err(e) => return Err(self.fail(e)),
            };
            match msg {
                BackendMessage::NoticeResponse { fields } => self.push_notice(fields),
                BackendMessage::NotificationResponse {
                    process_id,
                    channel,
                    payload,
                } => {
                    debug!(process_id, %channel, "notification");
                    self.notifications.push_back(Notification {
                        process_id,
                        channel,
                        payload,
                    });
                }
                BackendMessage::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                other => return Ok(other),
            }
        }
    }

    /// Send everything buffered.
    pub(crate) fn flush(&mut self) -> PgResult<()> {
        self.framer.flush().map_err(|e| self.fail(e))
    }

    /// Mark the connection dead if `err` means the stream is unusable.
    pub(crate) fn fail(&mut self, err: PgError) -> PgError {
        if err.is_fatal() && !self.closed {
            warn!(error = %err, "connection lost");
            self.closed = true;
        }
        err
    }

    pub(crate) fn unexpected(&mut self, msg: &BackendMessage, phase: &str) -> PgError {
        self.fail(PgError::protocol(format!(
            "unexpected {} message during {}",
            msg.name(),
            phase
        )))
    }

    fn push_notice(&mut self, fields: HashMap<u8, String>) {
        let notice = ServerError::from_fields(fields);
        warn!(
            target: "pgproto::notice",
            severity = %notice.severity,
            code = %notice.code,
            "{}",
            notice.message
        );
        if self.notices.len() == MAX_NOTICES {
            self.notices.pop_front();
        }
        self.notices.push_back(notice);
    }

    pub(crate) fn ensure_open(&self) -> PgResult<()> {
        if self.closed {
            return Err(PgError::ConnectionClosed);
        }
        if self.exchange != ExchangeState::Idle {
            return Err(PgError::interface(
                "connection is not ready: a previous exchange did not complete",
            ));
        }
        Ok(())
    }

    pub(crate) fn in_transaction(&self) -> bool {
        self.transaction_status != TransactionStatus::Idle
    }

    /// Open a transaction block unless one is open or autocommit is on.
    pub(crate) fn begin_if_needed(&mut self) -> PgResult<()> {
        if !self.autocommit && !self.in_transaction() {
            self.simple_query("begin transaction")?;
        }
        Ok(())
    }

    fn commit(&mut self) -> PgResult<()> {
        self.simple_query("commit").map(drop)
    }

    fn rollback(&mut self) -> PgResult<()> {
        if !self.in_transaction() {
            return Ok(());
        }
        self.simple_query("rollback").map(drop)
    }

    fn terminate(&mut self) {
        self.closed = true;
        if let Err(e) = self.framer.send(&TerminateMessage) {
            debug!(error = %e, "terminate not delivered");
        }
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        if !self.closed {
            self.terminate();
        }
    }
}

// ============================================================================
// Two-phase commit
// ============================================================================

/// A two-phase commit transaction id. Only `gtrid` reaches the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Xid {
    pub format_id: i32,
    pub gtrid: String,
    pub bqual: String,
}

impl Xid {
    pub fn new(format_id: i32, gtrid: impl Into<String>, bqual: impl Into<String>) -> Self {
        Self {
            format_id,
            gtrid: gtrid.into(),
            bqual: bqual.into(),
        }
    }

    fn literal(&self) -> String {
        format!("'{}'", self.gtrid.replace('\'', "''"))
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Cancels the running query of one connection from any thread.
#[derive(Debug, Clone)]
pub struct CancelToken {
    endpoint: Endpoint,
    timeout: Option<Duration>,
    process_id: i32,
    secret_key: i32,
}

impl CancelToken {
    /// Open a separate connection and send a CancelRequest.
    ///
    /// The server gives no reply; success only means the request was sent.
    pub fn cancel(&self) -> PgResult<()> {
        let mut stream = self.endpoint.open(self.timeout)?;
        let msg = CancelRequestMessage {
            process_id: self.process_id,
            secret_key: self.secret_key,
        };
        stream.write_all(&msg.encode())?;
        stream.flush()?;
        debug!(pid = self.process_id, endpoint = %self.endpoint, "cancel request sent");
        Ok(())
    }
}

// ============================================================================
// Connection
// ============================================================================

/// A PostgreSQL connection.
///
/// Cheap to clone; clones and the cursors created from them share one
/// server session. Only one exchange runs at a time: an operation that
/// finds the session busy fails with an `InterfaceError` instead of waiting.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Mutex<ConnectionInner>>,
}

impl ErrorKinds for Connection {}

impl Connection {
    /// Connect over TCP or a unix socket as described by `config`.
    pub fn connect(config: PgConfig) -> PgResult<Self> {
        let stream = Endpoint::from_config(&config).open(config.timeout)?;
        Self::establish(config, stream, None)
    }

    /// Connect from a `postgresql://` URL.
    pub fn connect_url(url: &str) -> PgResult<Self> {
        Self::connect(PgConfig::from_url(url)?)
    }

    /// Connect, upgrading to TLS through `connector` when the server agrees.
    pub fn connect_tls(config: PgConfig, connector: &dyn TlsConnector) -> PgResult<Self> {
        let stream = Endpoint::from_config(&config).open(config.timeout)?;
        Self::establish(config, stream, Some(connector))
    }

    /// Run the handshake over an already-open stream.
    pub fn connect_with_transport(config: PgConfig, stream: Box<dyn Transport>) -> PgResult<Self> {
        Self::establish(config, stream, None)
    }

    pub(crate) fn establish(
        config: PgConfig,
        stream: Box<dyn Transport>,
        tls: Option<&dyn TlsConnector>,
    ) -> PgResult<Self> {
        let stream = negotiate_ssl(&config, stream, tls)?;
        let mut inner = ConnectionInner::new(MessageFramer::new(stream), &config);
        if let Err(e) = inner.startup(&config) {
            tracing::error!(error = %e, user = %config.user, "connection startup failed");
            inner.closed = true;
            return Err(e);
        }
        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    /// Claim the session for one exchange.
    pub(crate) fn lock(&self) -> PgResult<MutexGuard<'_, ConnectionInner>> {
        self.inner
            .try_lock()
            .ok_or_else(|| PgError::interface("another exchange is in progress on this connection"))
    }

    pub fn cursor(&self) -> Cursor {
        Cursor::new(self.clone())
    }

    /// Execute one statement and return all of its rows.
    pub fn run(&self, query: &str, params: impl Into<Params>) -> PgResult<Vec<Vec<PgValue>>> {
        let mut cursor = self.cursor();
        cursor.execute(query, params)?;
        if cursor.description().is_none() {
            return Ok(Vec::new());
        }
        cursor.fetchall()
    }

    /// Run a script through the simple query protocol. No parameters; every
    /// value comes back in text format.
    pub fn execute_simple(&self, sql: &str) -> PgResult<Vec<QueryResult>> {
        self.lock()?.simple_query(sql)
    }

    pub fn commit(&self) -> PgResult<()> {
        self.lock()?.commit()
    }

    /// Roll back the current transaction; does nothing outside one.
    pub fn rollback(&self) -> PgResult<()> {
        self.lock()?.rollback()
    }

    /// Close the session. Closing twice is an error.
    pub fn close(&self) -> PgResult<()> {
        let mut inner = self.lock()?;
        if inner.closed {
            return Err(PgError::ConnectionClosed);
        }
        inner.terminate();
        debug!("connection closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn autocommit(&self) -> bool {
        self.inner.lock().autocommit
    }

    pub fn set_autocommit(&self, autocommit: bool) {
        self.inner.lock().autocommit = autocommit;
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.inner.lock().transaction_status
    }

    pub fn in_transaction(&self) -> bool {
        self.inner.lock().in_transaction()
    }

    pub fn paramstyle(&self) -> ParamStyle {
        self.inner.lock().paramstyle
    }

    pub fn set_paramstyle(&self, style: ParamStyle) {
        self.inner.lock().paramstyle = style;
    }

    pub fn backend_pid(&self) -> i32 {
        self.inner.lock().backend_pid
    }

    /// A server parameter reported through ParameterStatus.
    pub fn parameter(&self, name: &str) -> Option<String> {
        self.inner.lock().parameters.get(name).cloned()
    }

    pub fn server_version(&self) -> Option<String> {
        self.parameter("server_version")
    }

    /// Number of statements currently prepared for this session.
    pub fn cached_statements(&self) -> usize {
        self.inner.lock().statement_cache.len()
    }

    pub fn cancel_token(&self) -> CancelToken {
        let inner = self.inner.lock();
        CancelToken {
            endpoint: inner.endpoint.clone(),
            timeout: inner.timeout,
            process_id: inner.backend_pid,
            secret_key: inner.backend_secret_key,
        }
    }

    // ========================================================================
    // Notifications and notices
    // ========================================================================

    /// Queued notifications, oldest first. The queue is left intact.
    pub fn notifications(&self) -> Vec<Notification> {
        self.inner.lock().notifications.iter().cloned().collect()
    }

    /// Take every queued notification.
    pub fn drain_notifications(&self) -> Vec<Notification> {
        self.inner.lock().notifications.drain(..).collect()
    }

    /// The most recent server notices (the `Warning` surface).
    pub fn notices(&self) -> Vec<ServerError> {
        self.inner.lock().notices.iter().cloned().collect()
    }

    pub fn drain_notices(&self) -> Vec<ServerError> {
        self.inner.lock().notices.drain(..).collect()
    }

    // ========================================================================
    // Type overrides
    // ========================================================================

    /// Install conversion hooks for this session, replacing any installed before.
    pub fn set_overrides(&self, overrides: TypeOverrides) {
        self.inner.lock().overrides = overrides;
    }

    pub fn overrides(&self) -> TypeOverrides {
        self.inner.lock().overrides.clone()
    }

    pub fn clear_overrides(&self) {
        self.inner.lock().overrides.clear();
    }

    // ========================================================================
    // Two-phase commit
    // ========================================================================

    pub fn xid(&self, format_id: i32, gtrid: impl Into<String>, bqual: impl Into<String>) -> Xid {
        Xid::new(format_id, gtrid, bqual)
    }

    /// Start a two-phase transaction. Must be called outside a transaction.
    pub fn tpc_begin(&self, xid: Xid) -> PgResult<()> {
        let mut inner = self.lock()?;
        if inner.autocommit {
            inner.simple_query("begin transaction")?;
        }
        inner.xid = Some(xid);
        Ok(())
    }

    /// First phase: `PREPARE TRANSACTION`.
    pub fn tpc_prepare(&self) -> PgResult<()> {
        let mut inner = self.lock()?;
        let xid = inner.xid.clone().ok_or_else(|| {
            PgError::programming("cannot tpc_prepare() without a TPC transaction")
        })?;
        inner.simple_query(&format!("PREPARE TRANSACTION {}", xid.literal()))?;
        Ok(())
    }

    /// Commit a prepared transaction, or do a one-phase commit if the
    /// current one was never prepared.
    pub fn tpc_commit(&self, xid: Option<Xid>) -> PgResult<()> {
        self.tpc_finish(xid, "COMMIT PREPARED", "tpc_commit")
    }

    pub fn tpc_rollback(&self, xid: Option<Xid>) -> PgResult<()> {
        self.tpc_finish(xid, "ROLLBACK PREPARED", "tpc_rollback")
    }

    fn tpc_finish(&self, xid: Option<Xid>, command: &str, caller: &str) -> PgResult<()> {
        let mut inner = self.lock()?;
        let xid = xid.or_else(|| inner.xid.clone()).ok_or_else(|| {
            PgError::programming(format!("cannot {}() without a TPC transaction", caller))
        })?;

        let prepared = recover(&mut *inner)?.iter().any(|x| x.gtrid == xid.gtrid);
        let result = if prepared {
            inner
                .simple_query(&format!("{} {}", command, xid.literal()))
                .map(drop)
        } else if command == "COMMIT PREPARED" {
            inner.commit()
        } else {
            inner.rollback()
        };
        inner.xid = None;
        result
    }

    /// Transactions prepared on the server and not yet resolved.
    pub fn tpc_recover(&self) -> PgResult<Vec<Xid>> {
        let mut inner = self.lock()?;
        recover(&mut *inner)
    }
}

fn recover(inner: &mut ConnectionInner) -> PgResult<Vec<Xid>> {
    let results = inner.simple_query("select gid FROM pg_prepared_xacts")?;
    Ok(results
        .into_iter()
        .flat_map(|r| r.rows)
        .filter_map(|row| match row.into_iter().next() {
            Some(PgValue::Text(gid)) => Some(Xid::new(0, gid, "")),
            _ => None,
        })
        .collect())
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.try_lock() {
            Some(inner) => f
                .debug_struct("Connection")
                .field("pid", &inner.backend_pid)
                .field("status", &inner.transaction_status)
                .field("closed", &inner.closed)
                .finish(),
            None => f.debug_struct("Connection").finish_non_exhaustive(),
        }
    }
}
