//! TLS transport
//!
//! Certificate loading for the server, and [`TlsConnection`]: a TLS session
//! over any [`Connection`] that reports itself as a secured layer.

use rustls::pki_types::ServerName;
use rustls::ServerConfig;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::io::{split, AsyncRead, AsyncWrite, ReadBuf, ReadHalf, WriteHalf};
use tokio::time::Instant;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};

use crate::core::conn::{ConnStream, Connection, Layer, SecurityKind};

/// Create TLS config from certificate and key files
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> io::Result<Arc<ServerConfig>> {
    let cert_file = File::open(cert_path)?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs: Vec<_> = rustls_pemfile::certs(&mut cert_reader)
        .filter_map(|r| r.ok())
        .collect();

    if certs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "No certificates found in cert file",
        ));
    }

    let key_file = File::open(key_path)?;
    let mut key_reader = BufReader::new(key_file);
    let key = rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "No private key found"))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    // Session tickets let reconnecting clients skip the full handshake
    if let Ok(ticketer) = rustls::crypto::ring::Ticketer::new() {
        config.ticketer = ticketer;
    }

    Ok(Arc::new(config))
}

type Stream = TlsStream<ConnStream>;

/// TLS session over an inner connection
///
/// Reads and writes go through separate halves so a reader task and a writer
/// task can use the connection at once.
pub struct TlsConnection {
    inner: Arc<dyn Connection>,
    reader: Mutex<ReadHalf<Stream>>,
    writer: Mutex<WriteHalf<Stream>>,
}

impl TlsConnection {
    /// Run the server side of the handshake over `conn`
    pub async fn accept(acceptor: &TlsAcceptor, conn: Arc<dyn Connection>) -> io::Result<Self> {
        let stream = acceptor.accept(ConnStream::new(Arc::clone(&conn))).await?;
        Ok(Self::from_stream(conn, TlsStream::from(stream)))
    }

    /// Run the client side of the handshake over `conn`
    pub async fn connect(
        connector: &TlsConnector,
        server_name: ServerName<'static>,
        conn: Arc<dyn Connection>,
    ) -> io::Result<Self> {
        let stream = connector
            .connect(server_name, ConnStream::new(Arc::clone(&conn)))
            .await?;
        Ok(Self::from_stream(conn, TlsStream::from(stream)))
    }

    fn from_stream(inner: Arc<dyn Connection>, stream: Stream) -> Self {
        let (reader, writer) = split(stream);
        Self {
            inner,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }

    pub fn inner(&self) -> &Arc<dyn Connection> {
        &self.inner
    }

    fn reader(&self) -> MutexGuard<'_, ReadHalf<Stream>> {
        self.reader.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn writer(&self) -> MutexGuard<'_, WriteHalf<Stream>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for TlsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnection")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl Connection for TlsConnection {
    fn poll_read(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.reader()).poll_read(cx, buf)
    }

    fn poll_write(&self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.writer()).poll_write(cx, buf)
    }

    fn poll_flush(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.writer()).poll_flush(cx)
    }

    /// Sends close_notify, then half-closes the inner connection
    fn poll_close_write(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.writer()).poll_shutdown(cx)
    }

    fn close(&self) {
        self.inner.close();
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.inner.set_read_deadline(deadline);
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.inner.set_write_deadline(deadline);
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    fn layer(&self) -> Layer<'_> {
        Layer::Secured {
            kind: SecurityKind::Tls,
            inner: self.inner.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_tls_config_invalid_cert() {
        let mut cert_file = NamedTempFile::new().unwrap();
        cert_file.write_all(b"invalid cert").unwrap();

        let mut key_file = NamedTempFile::new().unwrap();
        key_file.write_all(b"invalid key").unwrap();

        let result = load_server_config(cert_file.path(), key_file.path());

        assert!(result.is_err());
    }

    #[test]
    fn test_tls_config_missing_file() {
        let result = load_server_config(Path::new("/nonexistent/cert.pem"), Path::new("/nonexistent/key.pem"));
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::NotFound);
    }
}
