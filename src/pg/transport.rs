//! Byte-stream transports.
//!
//! The driver speaks the protocol over any blocking `Read + Write` stream.
//! TCP and unix sockets are opened here; TLS is supplied by the caller
//! through [`TlsConnector`], which upgrades an already-open stream.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, error};

use super::config::PgConfig;
use super::error::{BoxError, PgError, PgResult};

/// A blocking byte stream carrying protocol traffic.
pub trait Transport: Read + Write + Send {}

impl<T: Read + Write + Send> Transport for T {}

/// Upgrades a plain stream to TLS after the server accepted an SSLRequest.
pub trait TlsConnector: Send + Sync {
    fn connect(&self, host: &str, stream: Box<dyn Transport>) -> Result<Box<dyn Transport>, BoxError>;
}

/// Where a server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl Endpoint {
    pub fn from_config(config: &PgConfig) -> Self {
        match &config.unix_socket {
            // A directory holds `.s.PGSQL.<port>`, as with libpq
            Some(path) if path.is_dir() => {
                Endpoint::Unix(path.join(format!(".s.PGSQL.{}", config.port)))
            }
            Some(path) => Endpoint::Unix(path.clone()),
            None => Endpoint::Tcp {
                host: config.host.clone(),
                port: config.port,
            },
        }
    }

    /// Open a plain stream to this endpoint.
    pub fn open(&self, timeout: Option<Duration>) -> PgResult<Box<dyn Transport>> {
        match self {
            Endpoint::Tcp { host, port } => {
                let stream = connect_tcp(host, *port, timeout)?;
                Ok(Box::new(stream))
            }
            Endpoint::Unix(path) => open_unix(path, timeout),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "{}:{}", host, port),
            Endpoint::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

fn connect_tcp(host: &str, port: u16, timeout: Option<Duration>) -> PgResult<TcpStream> {
    let addrs = (host, port).to_socket_addrs().map_err(|e| {
        error!(host, port, error = %e, "could not resolve host");
        PgError::interface(format!("could not resolve {}:{}: {}", host, port, e))
    })?;

    let mut last_error = None;
    for addr in addrs {
        let attempt = match timeout {
            Some(t) => TcpStream::connect_timeout(&addr, t),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                stream.set_read_timeout(timeout)?;
                stream.set_write_timeout(timeout)?;
                debug!(%addr, "tcp connected");
                return Ok(stream);
            }
            Err(e) => last_error = Some(e),
        }
    }

    let reason = last_error.map_or_else(|| "no addresses".to_string(), |e| e.to_string());
    error!(host, port, error = %reason, "could not connect");
    Err(PgError::interface(format!(
        "could not connect to {}:{}: {}",
        host, port, reason
    )))
}

#[cfg(unix)]
fn open_unix(path: &std::path::Path, timeout: Option<Duration>) -> PgResult<Box<dyn Transport>> {
    use std::os::unix::net::UnixStream;

    let stream = UnixStream::connect(path).map_err(|e| {
        error!(path = %path.display(), error = %e, "could not connect");
        PgError::interface(format!("could not connect to {}: {}", path.display(), e))
    })?;
    stream.set_read_timeout(timeout)?;
    stream.set_write_timeout(timeout)?;
    debug!(path = %path.display(), "unix socket connected");
    Ok(Box::new(stream))
}

#[cfg(not(unix))]
fn open_unix(path: &std::path::Path, _timeout: Option<Duration>) -> PgResult<Box<dyn Transport>> {
    Err(PgError::interface(format!(
        "unix sockets are not available on this platform: {}",
        path.display()
    )))
}
