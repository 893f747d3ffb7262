//! Direct TCP dialer

use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

use crate::config::ConnConfig;
use crate::core::conn::{Connection, CounterConnection, TcpConnection};
use crate::core::hooks::{Dialer, TrafficCounters};
use crate::core::net::{Destination, Network};
use crate::core::session::Session;
use crate::logger::log;

/// Dials destinations with the operating system's TCP stack
#[derive(Debug, Clone)]
pub struct SystemDialer {
    connect_timeout: Duration,
    tcp_nodelay: bool,
    /// Outbound traffic counters; destination reads count as downlink
    traffic: Option<TrafficCounters>,
}

impl Default for SystemDialer {
    fn default() -> Self {
        Self::from_config(&ConnConfig::default())
    }
}

impl SystemDialer {
    pub fn new(connect_timeout: Duration, tcp_nodelay: bool) -> Self {
        Self {
            connect_timeout,
            tcp_nodelay,
            traffic: None,
        }
    }

    pub fn from_config(config: &ConnConfig) -> Self {
        Self::new(config.connect_timeout, config.tcp_nodelay)
    }

    pub fn with_traffic(mut self, traffic: TrafficCounters) -> Self {
        self.traffic = Some(traffic);
        self
    }
}

#[async_trait]
impl Dialer for SystemDialer {
    async fn dial(&self, session: &Session, destination: &Destination) -> io::Result<Arc<dyn Connection>> {
        if destination.network != Network::Tcp {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("cannot dial {} destinations", destination.network),
            ));
        }

        let addr = destination.to_socket_addr().await?;
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out after {:?}", destination, self.connect_timeout),
                )
            })??;

        if self.tcp_nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                log::debug!(session = session.id(), error = %e, "Failed to set TCP_NODELAY");
            }
        }
        log::debug!(session = session.id(), destination = %destination, remote = %addr, "Dialed");

        let conn: Arc<dyn Connection> = Arc::new(TcpConnection::new(stream));
        Ok(match &self.traffic {
            Some(traffic) => Arc::new(CounterConnection::new(
                conn,
                Some(Arc::clone(&traffic.downlink)),
                Some(Arc::clone(&traffic.uplink)),
            )),
            None => conn,
        })
    }
}
