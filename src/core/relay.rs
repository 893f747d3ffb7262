//! Per-direction relay engine
//!
//! [`Relay::transfer`] moves one direction of a proxied connection. When both
//! ends are connections that unwrap down to raw TCP sockets and the platform
//! supports it, bytes move with kernel splice; otherwise a buffered loop
//! copies them. Both paths feed the activity signal and the traffic counters
//! captured while unwrapping.

use serde::Deserialize;
use std::fmt;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::conn::{ConnIo, Connection, SecurityKind};
use super::hooks::Counter;
use super::session::Session;
use super::signal::ActivityUpdater;
use super::splice;
use super::unwrap::{Side, Unwrapped, Unwrapper};
use crate::logger::log;

/// Default buffer size for the buffered path (32KB)
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Where a relay direction reads from
pub enum Source<'a> {
    /// A connection; eligible for unwrapping and splice
    Conn(&'a dyn Connection),
    /// An already-buffered stream, such as the read half of a [`Link`](super::proxy::Link)
    Stream(&'a mut (dyn AsyncRead + Send + Unpin)),
}

/// Where a relay direction writes to
pub enum Sink<'a> {
    Conn(&'a dyn Connection),
    Stream(&'a mut (dyn AsyncWrite + Send + Unpin)),
}

/// How a transfer was carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyPath {
    Splice,
    Buffered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyOutcome {
    /// Bytes delivered to the sink
    pub bytes: u64,
    pub path: CopyPath,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStage {
    Read,
    Write,
}

impl fmt::Display for CopyStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CopyStage::Read => "read",
            CopyStage::Write => "write",
        })
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("splice failed after {transferred} bytes: {source}")]
    Splice {
        transferred: u64,
        #[source]
        source: io::Error,
    },

    #[error("failed to process response: {stage} failed after {transferred} bytes: {source}")]
    Copy {
        stage: CopyStage,
        transferred: u64,
        #[source]
        source: io::Error,
    },
}

impl RelayError {
    /// Bytes that reached the sink before the failure
    pub fn transferred(&self) -> u64 {
        match self {
            RelayError::Splice { transferred, .. } | RelayError::Copy { transferred, .. } => {
                *transferred
            }
        }
    }
}

/// Which platforms may splice, which security layers may be bypassed, and the
/// buffer size for the copy loop
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RelayPolicy {
    /// Matched against `std::env::consts::OS`
    pub splice_platforms: Vec<String>,
    pub security_kinds: Vec<SecurityKind>,
    pub buffer_size: usize,
}

impl Default for RelayPolicy {
    fn default() -> Self {
        Self {
            splice_platforms: vec!["linux".to_string(), "android".to_string()],
            security_kinds: SecurityKind::ALL.to_vec(),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl RelayPolicy {
    /// A policy that always takes the buffered path
    pub fn buffered_only() -> Self {
        Self {
            splice_platforms: Vec::new(),
            ..Self::default()
        }
    }

    /// Whether the running platform is allowed to splice
    pub fn splice_allowed(&self) -> bool {
        splice::SUPPORTED
            && self
                .splice_platforms
                .iter()
                .any(|p| p.eq_ignore_ascii_case(std::env::consts::OS))
    }
}

enum Endpoint<'a, S: ?Sized> {
    /// The connection as supplied, and what unwrapping found under it
    Conn(&'a dyn Connection, Unwrapped<'a>),
    Stream(&'a mut S),
}

impl<S: ?Sized> Endpoint<'_, S> {
    fn counter(&self) -> Option<std::sync::Arc<dyn Counter>> {
        match self {
            Endpoint::Conn(_, unwrapped) => unwrapped.counter.clone(),
            Endpoint::Stream(_) => None,
        }
    }
}

/// The handle the buffered path uses for a connection endpoint.
///
/// Normally the unwrapped connection, counted with the captured counter. The
/// supplied connection is used instead, counting for itself, when the other
/// end is a connection too (the opposite counter is discarded there) or when
/// unwrapping removed a security layer the peer still expects.
fn buffered_handle<'a>(
    original: &'a dyn Connection,
    unwrapped: &Unwrapped<'a>,
    conn_to_conn: bool,
    counter: &mut Option<std::sync::Arc<dyn Counter>>,
) -> &'a dyn Connection {
    if conn_to_conn || unwrapped.secured {
        *counter = None;
        original
    } else {
        unwrapped.conn
    }
}

#[derive(Debug, Clone)]
pub struct Relay {
    policy: RelayPolicy,
    unwrapper: Unwrapper,
}

impl Default for Relay {
    fn default() -> Self {
        Self::new(RelayPolicy::default())
    }
}

impl Relay {
    pub fn new(policy: RelayPolicy) -> Self {
        let unwrapper = Unwrapper::new(policy.security_kinds.clone());
        Self { policy, unwrapper }
    }

    pub fn policy(&self) -> &RelayPolicy {
        &self.policy
    }

    pub fn unwrapper(&self) -> &Unwrapper {
        &self.unwrapper
    }

    /// Whether a transfer from `reader` to `writer` would take the splice path
    pub fn can_splice(&self, reader: &dyn Connection, writer: &dyn Connection) -> bool {
        self.policy.splice_allowed()
            && self.unwrapper.unwrap(reader, Side::Read).socket().is_some()
            && self.unwrapper.unwrap(writer, Side::Write).socket().is_some()
    }

    /// Move bytes from `source` to `sink` until the source reaches EOF.
    ///
    /// Clean EOF, including an unexpected EOF from the source, is success. The
    /// counter of a counted connection is applied only while that connection is
    /// the unwrapped side of the transfer, so no byte is counted twice. On the
    /// buffered path the counter of the opposite side is dropped; a connection
    /// endpoint is read or written through its unwrapped handle, or through
    /// the supplied one when both ends are connections or a security layer was
    /// removed.
    pub async fn transfer(
        &self,
        session: &Session,
        source: Source<'_>,
        sink: Sink<'_>,
        timer: &dyn ActivityUpdater,
    ) -> Result<CopyOutcome, RelayError> {
        let source = match source {
            Source::Conn(conn) => Endpoint::Conn(conn, self.unwrapper.unwrap(conn, Side::Read)),
            Source::Stream(stream) => Endpoint::Stream(stream),
        };
        let sink = match sink {
            Sink::Conn(conn) => Endpoint::Conn(conn, self.unwrapper.unwrap(conn, Side::Write)),
            Sink::Stream(stream) => Endpoint::Stream(stream),
        };
        let mut read_counter = source.counter();
        let mut write_counter = sink.counter();

        let sockets = match (&source, &sink) {
            (Endpoint::Conn(_, reader), Endpoint::Conn(_, writer)) => reader.socket().zip(writer.socket()),
            _ => None,
        };
        if let Some((src, dst)) = sockets.filter(|_| self.policy.splice_allowed()) {
            log::debug!(session = session.id(), "Relaying with splice");
            tokio::task::yield_now().await;

            let (n, result) = splice::splice_copy(src, dst, timer).await;
            add(&read_counter, n);
            add(&write_counter, n);
            return match result {
                Ok(()) => Ok(CopyOutcome {
                    bytes: n,
                    path: CopyPath::Splice,
                }),
                Err(e) if is_eof(&e) => Ok(CopyOutcome {
                    bytes: n,
                    path: CopyPath::Splice,
                }),
                Err(source) => Err(RelayError::Splice {
                    transferred: n,
                    source,
                }),
            };
        }

        let conn_to_conn = matches!((&source, &sink), (Endpoint::Conn(..), Endpoint::Conn(..)));
        let mut conn_reader;
        let reader: &mut (dyn AsyncRead + Send + Unpin) = match source {
            Endpoint::Stream(stream) => stream,
            Endpoint::Conn(original, unwrapped) => {
                write_counter = None;
                let handle = buffered_handle(original, &unwrapped, conn_to_conn, &mut read_counter);
                conn_reader = ConnIo::new(handle);
                &mut conn_reader
            }
        };
        let mut conn_writer;
        let writer: &mut (dyn AsyncWrite + Send + Unpin) = match sink {
            Endpoint::Stream(stream) => stream,
            Endpoint::Conn(original, unwrapped) => {
                read_counter = None;
                let handle = buffered_handle(original, &unwrapped, conn_to_conn, &mut write_counter);
                conn_writer = ConnIo::new(handle);
                &mut conn_writer
            }
        };

        let mut buf = vec![0u8; self.policy.buffer_size.max(1)];
        let mut transferred = 0u64;
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if is_eof(&e) => break,
                Err(source) => {
                    return Err(RelayError::Copy {
                        stage: CopyStage::Read,
                        transferred,
                        source,
                    })
                }
            };

            if let Err(source) = write_chunk(writer, &buf[..n]).await {
                return Err(RelayError::Copy {
                    stage: CopyStage::Write,
                    transferred,
                    source,
                });
            }

            timer.update();
            add(&read_counter, n as u64);
            add(&write_counter, n as u64);
            transferred += n as u64;
        }

        Ok(CopyOutcome {
            bytes: transferred,
            path: CopyPath::Buffered,
        })
    }
}

async fn write_chunk(writer: &mut (dyn AsyncWrite + Send + Unpin), chunk: &[u8]) -> io::Result<()> {
    writer.write_all(chunk).await?;
    writer.flush().await
}

fn add(counter: &Option<std::sync::Arc<dyn Counter>>, n: u64) {
    if n == 0 {
        return;
    }
    if let Some(counter) = counter {
        counter.add(n);
    }
}

fn is_eof(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::UnexpectedEof
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::conn::{CounterConnection, TcpConnection};
    use crate::core::hooks::AtomicCounter;
    use crate::core::signal::ActivityTimer;
    use std::io::Cursor;
    use std::sync::Arc;
    use std::time::Duration;

    fn session() -> Session {
        Session::new(1, "test")
    }

    /// Reader that fails after yielding its payload
    struct FailingReader {
        payload: Option<Vec<u8>>,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            match self.payload.take() {
                Some(payload) => {
                    buf.put_slice(&payload);
                    std::task::Poll::Ready(Ok(()))
                }
                None => std::task::Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "reset",
                ))),
            }
        }
    }

    #[tokio::test]
    async fn test_stream_to_stream_copies_everything() {
        let relay = Relay::default();
        let timer = ActivityTimer::new(Duration::from_secs(60));
        let data = vec![5u8; 100 * 1024];
        let mut reader = Cursor::new(data.clone());
        let mut writer: Vec<u8> = Vec::new();

        let outcome = relay
            .transfer(
                &session(),
                Source::Stream(&mut reader),
                Sink::Stream(&mut writer),
                &timer,
            )
            .await
            .unwrap();

        assert_eq!(outcome.bytes, data.len() as u64);
        assert_eq!(outcome.path, CopyPath::Buffered);
        assert_eq!(writer, data);
        assert!(timer.updates() >= 1);
    }

    #[tokio::test]
    async fn test_empty_source_is_success() {
        let relay = Relay::default();
        let timer = ActivityTimer::new(Duration::from_secs(60));
        let mut reader = Cursor::new(Vec::new());
        let mut writer: Vec<u8> = Vec::new();

        let outcome = relay
            .transfer(
                &session(),
                Source::Stream(&mut reader),
                Sink::Stream(&mut writer),
                &timer,
            )
            .await
            .unwrap();
        assert_eq!(outcome.bytes, 0);
        assert_eq!(timer.updates(), 0);
    }

    #[tokio::test]
    async fn test_read_error_is_wrapped() {
        let relay = Relay::default();
        let timer = ActivityTimer::new(Duration::from_secs(60));
        let mut reader = FailingReader {
            payload: Some(b"partial".to_vec()),
        };
        let mut writer: Vec<u8> = Vec::new();

        let err = relay
            .transfer(
                &session(),
                Source::Stream(&mut reader),
                Sink::Stream(&mut writer),
                &timer,
            )
            .await
            .unwrap_err();

        assert!(err.to_string().starts_with("failed to process response"));
        assert_eq!(err.transferred(), 7);
        assert!(matches!(
            err,
            RelayError::Copy {
                stage: CopyStage::Read,
                ..
            }
        ));
        assert_eq!(writer, b"partial");
    }

    #[tokio::test]
    async fn test_stream_to_counted_conn_counts_write_side_only() {
        use tokio::io::AsyncReadExt;
        use tokio::net::{TcpListener, TcpStream};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let mut peer = client.unwrap();

        let read = Arc::new(AtomicCounter::new());
        let write = Arc::new(AtomicCounter::new());
        let conn = CounterConnection::new(
            Arc::new(TcpConnection::new(accepted.unwrap().0)),
            Some(read.clone()),
            Some(write.clone()),
        );

        let relay = Relay::default();
        let timer = ActivityTimer::new(Duration::from_secs(60));
        let mut reader = Cursor::new(vec![1u8; 4096]);
        let outcome = relay
            .transfer(&session(), Source::Stream(&mut reader), Sink::Conn(&conn), &timer)
            .await
            .unwrap();
        assert_eq!(outcome.bytes, 4096);

        let mut received = vec![0u8; 4096];
        peer.read_exact(&mut received).await.unwrap();

        // The unwrapped handle is written directly and the captured write counter applied once
        assert_eq!(write.value(), 4096);
        assert_eq!(read.value(), 0);
    }

    #[test]
    fn test_buffered_only_policy() {
        assert!(!RelayPolicy::buffered_only().splice_allowed());
    }

    #[test]
    fn test_default_policy_matches_platform() {
        let expected = cfg!(any(target_os = "linux", target_os = "android"));
        assert_eq!(RelayPolicy::default().splice_allowed(), expected);
    }

    #[test]
    fn test_policy_deserialize_defaults() {
        let policy: RelayPolicy = toml::from_str("buffer_size = 4096").unwrap();
        assert_eq!(policy.buffer_size, 4096);
        assert_eq!(policy.splice_platforms, vec!["linux", "android"]);
        assert_eq!(policy.security_kinds, SecurityKind::ALL.to_vec());
    }
}
