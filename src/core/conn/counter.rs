//! Byte-counting connection wrapper

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::ReadBuf;
use tokio::time::Instant;

use super::{Connection, Layer};
use crate::core::hooks::Counter;

/// Adds every byte read to `read_counter` and every byte written to `write_counter`
#[derive(Debug, Clone)]
pub struct CounterConnection {
    inner: Arc<dyn Connection>,
    read_counter: Option<Arc<dyn Counter>>,
    write_counter: Option<Arc<dyn Counter>>,
}

impl CounterConnection {
    pub fn new(
        inner: Arc<dyn Connection>,
        read_counter: Option<Arc<dyn Counter>>,
        write_counter: Option<Arc<dyn Counter>>,
    ) -> Self {
        Self {
            inner,
            read_counter,
            write_counter,
        }
    }

    pub fn inner(&self) -> &Arc<dyn Connection> {
        &self.inner
    }
}

impl Connection for CounterConnection {
    fn poll_read(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let result = self.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let n = buf.filled().len() - before;
            if n > 0 {
                if let Some(counter) = &self.read_counter {
                    counter.add(n as u64);
                }
            }
        }
        result
    }

    fn poll_write(&self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let result = self.inner.poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            if *n > 0 {
                if let Some(counter) = &self.write_counter {
                    counter.add(*n as u64);
                }
            }
        }
        result
    }

    fn poll_flush(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner.poll_flush(cx)
    }

    fn poll_close_write(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner.poll_close_write(cx)
    }

    fn close(&self) {
        self.inner.close()
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.inner.set_read_deadline(deadline)
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.inner.set_write_deadline(deadline)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    fn layer(&self) -> Layer<'_> {
        Layer::Counted {
            inner: &*self.inner,
            read: self.read_counter.as_ref(),
            write: self.write_counter.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::conn::{ConnIo, TcpConnection};
    use crate::core::hooks::AtomicCounter;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn test_counts_both_directions() {
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

        peer.write_all(&[7u8; 300]).await.unwrap();
        let mut buf = vec![0u8; 300];
        ConnIo::new(&conn).read_exact(&mut buf).await.unwrap();

        ConnIo::new(&conn).write_all(&[9u8; 120]).await.unwrap();
        let mut echoed = vec![0u8; 120];
        peer.read_exact(&mut echoed).await.unwrap();

        assert_eq!(read.value(), 300);
        assert_eq!(write.value(), 120);
    }
}
