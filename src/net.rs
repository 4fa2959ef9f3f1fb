//! Endpoint addressing for the control plane and the per-worker data sockets.
//!
//! On POSIX both live as Unix sockets inside the run directory; on platforms
//! without Unix sockets they fall back to loopback TCP ports (5500 for the
//! control plane, 5501 + slot id for worker data sockets).

use crate::error::{PoolError, Result};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};

#[cfg(unix)]
use std::path::PathBuf;
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

/// Loopback port for the control plane when Unix sockets are unavailable.
pub const CONTROL_PORT: u16 = 5500;

/// Base loopback port for worker data sockets; slot `i` listens on `5501 + i`.
pub const DATA_PORT_BASE: u16 = 5501;

/// An address a socket can be bound to or dialed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    #[cfg(unix)]
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl Endpoint {
    /// The control-plane address for a given run directory.
    pub fn control_plane(run_dir: &Path) -> Self {
        #[cfg(unix)]
        {
            Endpoint::Unix(run_dir.join("control.sock"))
        }
        #[cfg(not(unix))]
        {
            let _ = run_dir;
            Endpoint::Tcp(([127, 0, 0, 1], CONTROL_PORT).into())
        }
    }

    /// The data-socket address for a worker slot.
    pub fn worker_data(run_dir: &Path, slot_id: usize) -> Self {
        #[cfg(unix)]
        {
            Endpoint::Unix(run_dir.join(format!("worker-{}.sock", slot_id)))
        }
        #[cfg(not(unix))]
        {
            let _ = run_dir;
            Endpoint::Tcp(([127, 0, 0, 1], DATA_PORT_BASE + slot_id as u16).into())
        }
    }

    /// Parse the wire form produced by [`Endpoint::to_string`].
    pub fn parse(s: &str) -> Result<Self> {
        #[cfg(unix)]
        if let Some(path) = s.strip_prefix("unix:") {
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = s.strip_prefix("tcp:") {
            let addr = addr
                .parse()
                .map_err(|e| PoolError::Config(format!("invalid endpoint '{}': {}", s, e)))?;
            return Ok(Endpoint::Tcp(addr));
        }
        Err(PoolError::Config(format!("invalid endpoint '{}'", s)))
    }

    /// Bind a listener at this endpoint. A stale Unix socket file left behind
    /// by a previous run is removed first.
    pub async fn bind(&self) -> io::Result<Listener> {
        match self {
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                Ok(Listener::Unix(UnixListener::bind(path)?))
            }
            Endpoint::Tcp(addr) => Ok(Listener::Tcp(TcpListener::bind(addr).await?)),
        }
    }

    /// Dial this endpoint.
    pub async fn connect(&self) -> io::Result<Stream> {
        match self {
            #[cfg(unix)]
            Endpoint::Unix(path) => Ok(Stream::Unix(UnixStream::connect(path).await?)),
            Endpoint::Tcp(addr) => Ok(Stream::Tcp(TcpStream::connect(addr).await?)),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(unix)]
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp:{}", addr),
        }
    }
}

/// A bound listener at an [`Endpoint`].
pub enum Listener {
    #[cfg(unix)]
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl Listener {
    pub async fn accept(&self) -> io::Result<Stream> {
        match self {
            #[cfg(unix)]
            Listener::Unix(l) => {
                let (stream, _) = l.accept().await?;
                Ok(Stream::Unix(stream))
            }
            Listener::Tcp(l) => {
                let (stream, _) = l.accept().await?;
                Ok(Stream::Tcp(stream))
            }
        }
    }
}

/// A connected stream to either socket family.
#[derive(Debug)]
pub enum Stream {
    #[cfg(unix)]
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_flush(cx),
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_endpoint_roundtrip() {
        let ep = Endpoint::Tcp("127.0.0.1:5501".parse().unwrap());
        let wire = ep.to_string();
        assert_eq!(wire, "tcp:127.0.0.1:5501");
        assert_eq!(Endpoint::parse(&wire).unwrap(), ep);
    }

    #[cfg(unix)]
    #[test]
    fn test_unix_endpoint_roundtrip() {
        let ep = Endpoint::worker_data(Path::new("/tmp/poolgate-x"), 3);
        let wire = ep.to_string();
        assert_eq!(wire, "unix:/tmp/poolgate-x/worker-3.sock");
        assert_eq!(Endpoint::parse(&wire).unwrap(), ep);
    }

    #[test]
    fn test_invalid_endpoint() {
        assert!(Endpoint::parse("ftp://nope").is_err());
        assert!(Endpoint::parse("tcp:not-an-addr").is_err());
    }
}
