//! Connection abstraction
//!
//! Every endpoint the data plane touches is a [`Connection`]: a byte stream
//! whose read side and write side can be driven by two tasks at once, with
//! deadlines, half-close and addresses. Wrappers (byte counting, TLS) hold
//! an inner connection and report it through [`Connection::layer`] so the
//! relay can look through them for the raw socket underneath.

mod counter;
mod deadline;
mod tcp;

pub use counter::CounterConnection;
pub(crate) use deadline::{Direction, IoGate};
pub use tcp::TcpConnection;

use serde::Deserialize;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;

use super::hooks::Counter;

/// A full-duplex byte stream shared by reference between a reader task and a writer task
pub trait Connection: Send + Sync + fmt::Debug {
    fn poll_read(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>>;

    fn poll_write(&self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>>;

    fn poll_flush(&self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    /// Signal end-of-stream to the peer; reads keep working.
    fn poll_close_write(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;

    /// Close both directions. Pending and future reads and writes fail.
    fn close(&self);

    /// `None` clears the deadline. Expiry fails the pending operation with `TimedOut`.
    fn set_read_deadline(&self, deadline: Option<Instant>);

    fn set_write_deadline(&self, deadline: Option<Instant>);

    fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// The wrapping this connection applies, if the relay knows how to see through it
    fn layer(&self) -> Layer<'_> {
        Layer::Opaque
    }
}

/// One step of the wrapper chain exposed by [`Connection::layer`]
#[derive(Debug, Clone, Copy)]
pub enum Layer<'a> {
    /// A plain kernel TCP socket; the end of the chain
    Socket(&'a TcpConnection),
    /// Byte counting around `inner`
    Counted {
        inner: &'a dyn Connection,
        read: Option<&'a Arc<dyn Counter>>,
        write: Option<&'a Arc<dyn Counter>>,
    },
    /// A security session around `inner`
    Secured {
        kind: SecurityKind,
        inner: &'a dyn Connection,
    },
    /// Nothing the relay can look through
    Opaque,
}

/// Security layers that may wrap a raw socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityKind {
    Tls,
    Utls,
    Reality,
}

impl SecurityKind {
    pub const ALL: [SecurityKind; 3] = [SecurityKind::Tls, SecurityKind::Utls, SecurityKind::Reality];
}

impl fmt::Display for SecurityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SecurityKind::Tls => "tls",
            SecurityKind::Utls => "utls",
            SecurityKind::Reality => "reality",
        })
    }
}

/// Borrowed tokio I/O adapter over a connection
///
/// Stateless, so any number may exist for one connection at once.
#[derive(Debug, Clone, Copy)]
pub struct ConnIo<'a> {
    conn: &'a dyn Connection,
}

impl<'a> ConnIo<'a> {
    pub fn new(conn: &'a dyn Connection) -> Self {
        Self { conn }
    }
}

impl AsyncRead for ConnIo<'_> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.conn.poll_read(cx, buf)
    }
}

impl AsyncWrite for ConnIo<'_> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.conn.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.conn.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.conn.poll_close_write(cx)
    }
}

/// Owned tokio I/O adapter, for stacking stream-based layers such as TLS on a connection
#[derive(Debug, Clone)]
pub struct ConnStream {
    conn: Arc<dyn Connection>,
}

impl ConnStream {
    pub fn new(conn: Arc<dyn Connection>) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }
}

impl AsyncRead for ConnStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.conn.poll_read(cx, buf)
    }
}

impl AsyncWrite for ConnStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.conn.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.conn.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.conn.poll_close_write(cx)
    }
}
