//! Core proxy server implementation
//!
//! The Server binds one inbound handler to a dispatcher and turns each
//! accepted connection into a tracked session.

use std::sync::Arc;

use super::conn::{Connection, CounterConnection};
use super::hooks::{Dispatcher, TrafficCounters};
use super::net::Network;
use super::proxy::{GetInbound, Inbound, MemoryUser};
use super::session::SessionManager;
use crate::config::ConnConfig;
use crate::error::{ProxyError, Result, UserError};
use crate::logger::log;

/// Core proxy server
pub struct Server {
    /// Inbound tag, used in logs and stats names
    pub tag: String,
    pub inbound: Arc<dyn Inbound>,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub sessions: SessionManager,
    /// Connection performance configuration
    pub conn_config: ConnConfig,
    /// Inbound traffic counters; client reads count as uplink
    pub traffic: Option<TrafficCounters>,
}

impl Server {
    /// Create a new server builder
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Run one accepted connection through the inbound until it completes.
    ///
    /// A connection on a network the inbound does not advertise is rejected
    /// before any session is created.
    pub async fn handle_connection(&self, network: Network, conn: Arc<dyn Connection>) -> Result<()> {
        if !self.inbound.networks().contains(&network) {
            conn.close();
            return Err(ProxyError::UnsupportedNetwork(network));
        }

        let source = conn.peer_addr().ok();
        let conn = match &self.traffic {
            Some(traffic) => Arc::new(CounterConnection::new(
                conn,
                Some(Arc::clone(&traffic.uplink)),
                Some(Arc::clone(&traffic.downlink)),
            )) as Arc<dyn Connection>,
            None => conn,
        };

        let session = self.sessions.register(&self.tag, source);
        let session_id = session.id();
        let _guard = scopeguard::guard((), |_| {
            self.sessions.unregister(session_id);
        });

        let result = self
            .inbound
            .process(&session, network, conn, self.dispatcher.as_ref())
            .await;
        match &result {
            Ok(()) => log::session_end(session_id, &self.tag, None),
            Err(e) => log::session_end(session_id, &self.tag, Some(e)),
        }
        result
    }

    /// Add a user through the inbound's user manager, if it has one
    pub async fn add_user(&self, user: MemoryUser) -> std::result::Result<(), UserError> {
        match self.inbound.user_manager() {
            Some(manager) => manager.add_user(user).await,
            None => Err(UserError::Unsupported),
        }
    }

    /// Remove a user through the inbound's user manager, if it has one
    pub async fn remove_user(&self, email: &str) -> std::result::Result<(), UserError> {
        match self.inbound.user_manager() {
            Some(manager) => manager.remove_user(email).await,
            None => Err(UserError::Unsupported),
        }
    }
}

impl GetInbound for Server {
    fn inbound(&self) -> &dyn Inbound {
        self.inbound.as_ref()
    }
}

/// Builder for constructing a Server
pub struct ServerBuilder {
    tag: Option<String>,
    inbound: Option<Arc<dyn Inbound>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    sessions: Option<SessionManager>,
    conn_config: Option<ConnConfig>,
    traffic: Option<TrafficCounters>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            tag: None,
            inbound: None,
            dispatcher: None,
            sessions: None,
            conn_config: None,
            traffic: None,
        }
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn inbound(mut self, inbound: Arc<dyn Inbound>) -> Self {
        self.inbound = Some(inbound);
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Set session manager
    pub fn sessions(mut self, sessions: SessionManager) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Set connection configuration
    pub fn conn_config(mut self, config: ConnConfig) -> Self {
        self.conn_config = Some(config);
        self
    }

    pub fn traffic(mut self, traffic: TrafficCounters) -> Self {
        self.traffic = Some(traffic);
        self
    }

    /// Build the server
    ///
    /// Panics if the inbound or dispatcher is not set
    pub fn build(self) -> Server {
        Server {
            tag: self.tag.unwrap_or_else(|| "inbound".to_string()),
            inbound: self.inbound.expect("inbound is required"),
            dispatcher: self.dispatcher.expect("dispatcher is required"),
            sessions: self.sessions.unwrap_or_default(),
            conn_config: self.conn_config.unwrap_or_default(),
            traffic: self.traffic,
        }
    }
}
