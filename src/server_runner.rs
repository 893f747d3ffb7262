//! Server startup and accept loop
//!
//! This module binds the listener, performs the optional TLS handshake and
//! hands every accepted connection to the [`Server`].

use crate::config;
use crate::core::conn::{Connection, TcpConnection};
use crate::core::net::Network;
use crate::core::Server;
use crate::error::ProxyError;
use crate::logger::log;
use crate::transport::{load_server_config, TlsConnection};

use anyhow::Result;
use socket2::{SockRef, TcpKeepalive};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

/// TCP keepalive interval, the same as Go's net.ListenConfig default (15s).
/// Dead peers are detected in ~45s (3 probes × 15s).
const TCP_KEEPALIVE_SECS: u64 = 15;

/// Bind a TCP listener with SO_REUSEADDR for fast restarts
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> std::io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    // Allow immediate rebind after restart (skip TIME_WAIT)
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    TcpListener::from_std(socket.into())
}

/// Build the TLS acceptor when both certificate and key are configured
pub fn build_tls_acceptor(config: &config::ServerConfig) -> Result<Option<TlsAcceptor>> {
    match (&config.cert, &config.key) {
        (Some(cert), Some(key)) => {
            let tls_config = load_server_config(cert, key)?;
            Ok(Some(TlsAcceptor::from(tls_config)))
        }
        _ => Ok(None),
    }
}

/// Run the server: bind, then accept until `shutdown` is cancelled
pub async fn run_server(
    server: Arc<Server>,
    config: &config::ServerConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let tls_acceptor = build_tls_acceptor(config)?;
    let listener = bind_listener(config.listen, server.conn_config.tcp_backlog)?;
    let local_addr = listener.local_addr()?;

    log::info!(
        address = %local_addr,
        tag = %server.tag,
        destination = %config.destination,
        tls = tls_acceptor.is_some(),
        splice = config.relay.splice_allowed(),
        max_connections = server.conn_config.max_connections,
        "Server started"
    );

    serve(server, listener, tls_acceptor, shutdown).await
}

/// Accept connections from `listener` until `shutdown` is cancelled
pub async fn serve(
    server: Arc<Server>,
    listener: TcpListener,
    tls_acceptor: Option<TlsAcceptor>,
    shutdown: CancellationToken,
) -> Result<()> {
    // Connection limiter: 0 = unlimited
    let conn_limiter = if server.conn_config.max_connections > 0 {
        Some(Arc::new(Semaphore::new(server.conn_config.max_connections)))
    } else {
        None
    };

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => {
                log::info!("Accept loop stopped");
                break;
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                let peer_addr = addr.to_string();
                log::connection(&peer_addr, "new");

                // Acquire connection permit (backpressure when at limit)
                let permit = match &conn_limiter {
                    Some(limiter) => match Arc::clone(limiter).acquire_owned().await {
                        Ok(permit) => Some(permit),
                        // Semaphore closed, shutting down
                        Err(_) => break,
                    },
                    None => None,
                };

                let server = Arc::clone(&server);
                let tls_acceptor = tls_acceptor.clone();

                tokio::spawn(async move {
                    // Hold permit for the lifetime of this connection
                    let _permit = permit;
                    if let Err(e) = accept_connection(&server, stream, &peer_addr, tls_acceptor).await {
                        log::debug!(peer = %peer_addr, error = %e, "Connection error");
                    }
                    log::connection(&peer_addr, "closed");
                });
            }
            Err(e) => {
                log::error!(error = %e, "Failed to accept connection");
                // Continue accepting unless it's a fatal error
                if e.kind() == std::io::ErrorKind::Other {
                    break;
                }
            }
        }
    }

    Ok(())
}

/// Tune the socket, run the TLS handshake if configured and hand the
/// connection to the server
async fn accept_connection(
    server: &Server,
    stream: TcpStream,
    peer_addr: &str,
    tls_acceptor: Option<TlsAcceptor>,
) -> Result<()> {
    // Set TCP_NODELAY for lower latency
    if server.conn_config.tcp_nodelay {
        let _ = stream.set_nodelay(true);
    }

    // Enable TCP keepalive to detect dead peers (mobile disconnect, network change, etc.)
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(TCP_KEEPALIVE_SECS))
        .with_interval(Duration::from_secs(TCP_KEEPALIVE_SECS));
    let _ = SockRef::from(&stream).set_tcp_keepalive(&keepalive);

    let conn: Arc<dyn Connection> = Arc::new(TcpConnection::new(stream));
    let conn = match tls_acceptor {
        Some(acceptor) => {
            let tls = tls_handshake(&acceptor, conn, server.conn_config.tls_handshake_timeout).await?;
            log::debug!(peer = %peer_addr, "TLS handshake successful");
            tls
        }
        None => conn,
    };

    server.handle_connection(Network::Tcp, conn).await?;
    Ok(())
}

/// Server-side TLS handshake with timeout; the connection is closed on failure
pub async fn tls_handshake(
    acceptor: &TlsAcceptor,
    conn: Arc<dyn Connection>,
    timeout: Duration,
) -> Result<Arc<dyn Connection>, ProxyError> {
    match tokio::time::timeout(timeout, TlsConnection::accept(acceptor, Arc::clone(&conn))).await {
        Ok(Ok(tls)) => Ok(Arc::new(tls)),
        Ok(Err(e)) => {
            conn.close();
            Err(ProxyError::Tls(format!("handshake failed: {}", e)))
        }
        Err(_) => {
            conn.close();
            Err(ProxyError::Tls("handshake timeout".to_string()))
        }
    }
}
