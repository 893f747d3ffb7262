//! Raw kernel TCP socket as a [`Connection`]

use socket2::SockRef;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::task::{ready, Context, Poll};
use tokio::io::{Interest, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::Instant;

use super::{Connection, Direction, IoGate, Layer};

#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
    gate: IoGate,
}

impl TcpConnection {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            gate: IoGate::default(),
        }
    }

    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        TcpStream::connect(addr).await.map(Self::new)
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.stream.set_nodelay(nodelay)
    }

    /// Run a raw, non-blocking syscall against the socket once it is ready
    /// for `dir`, honoring close and deadlines.
    ///
    /// `f` must return `WouldBlock` only when the socket itself is not ready.
    pub(crate) async fn io_with<R>(
        &self,
        dir: Direction,
        mut f: impl FnMut(&TcpStream) -> io::Result<R>,
    ) -> io::Result<R> {
        let interest = match dir {
            Direction::Read => Interest::READABLE,
            Direction::Write => Interest::WRITABLE,
        };
        tokio::select! {
            biased;
            err = self.gate.interrupted(dir) => Err(err),
            res = self.stream.async_io(interest, || f(&self.stream)) => res,
        }
    }
}

impl From<TcpStream> for TcpConnection {
    fn from(stream: TcpStream) -> Self {
        Self::new(stream)
    }
}

impl Connection for TcpConnection {
    fn poll_read(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if let Poll::Ready(err) = self.gate.poll_interrupted(cx, Direction::Read) {
            return Poll::Ready(Err(err));
        }
        loop {
            ready!(self.stream.poll_read_ready(cx))?;
            match self.stream.try_read(buf.initialize_unfilled()) {
                Ok(n) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
    }

    fn poll_write(&self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if let Poll::Ready(err) = self.gate.poll_interrupted(cx, Direction::Write) {
            return Poll::Ready(Err(err));
        }
        loop {
            ready!(self.stream.poll_write_ready(cx))?;
            match self.stream.try_write(buf) {
                Ok(n) => return Poll::Ready(Ok(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
    }

    fn poll_close_write(&self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(SockRef::from(&self.stream).shutdown(Shutdown::Write))
    }

    fn close(&self) {
        if self.gate.is_closed() {
            return;
        }
        self.gate.close();
        let _ = SockRef::from(&self.stream).shutdown(Shutdown::Both);
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.gate.set_deadline(Direction::Read, deadline);
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.gate.set_deadline(Direction::Write, deadline);
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    fn layer(&self) -> Layer<'_> {
        Layer::Socket(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::conn::ConnIo;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn pair() -> (Arc<TcpConnection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (conn, accepted) = tokio::join!(TcpConnection::connect(addr), listener.accept());
        (Arc::new(conn.unwrap()), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_concurrent_read_and_write() {
        let (conn, peer) = pair().await;
        let (mut peer_rd, mut peer_wr) = peer.into_split();

        let reader = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 5];
                ConnIo::new(&*conn).read_exact(&mut buf).await.unwrap();
                buf
            })
        };
        let writer = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { ConnIo::new(&*conn).write_all(b"world").await.unwrap() })
        };

        peer_wr.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        peer_rd.read_exact(&mut echoed).await.unwrap();

        assert_eq!(reader.await.unwrap(), b"hello");
        writer.await.unwrap();
        assert_eq!(&echoed, b"world");
    }

    #[tokio::test]
    async fn test_close_interrupts_pending_read() {
        let (conn, _peer) = pair().await;
        let reader = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                ConnIo::new(&*conn).read(&mut buf).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.close();
        let res = tokio::time::timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_read_deadline() {
        let (conn, _peer) = pair().await;
        conn.set_read_deadline(Some(Instant::now() + Duration::from_millis(30)));
        let mut buf = [0u8; 16];
        let err = ConnIo::new(&*conn).read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_addresses() {
        let (conn, peer) = pair().await;
        assert_eq!(conn.peer_addr().unwrap(), peer.local_addr().unwrap());
        assert_eq!(conn.local_addr().unwrap(), peer.peer_addr().unwrap());
    }
}
