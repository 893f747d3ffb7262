//! Proxy roles
//!
//! Protocol implementations plug into the data plane through these traits:
//! an [`Inbound`] accepts client connections and hands them to a
//! [`Dispatcher`], an [`Outbound`] takes the other end of the resulting
//! [`Link`] and carries it to the destination. Handlers that keep a user list
//! expose it through [`UserManager`]; holders of a handler expose it through
//! [`GetInbound`] / [`GetOutbound`].

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use super::conn::Connection;
use super::hooks::{Dialer, Dispatcher};
use super::net::Network;
use super::session::Session;
use crate::error::{Result, UserError};

pub type LinkReader = Box<dyn AsyncRead + Send + Unpin>;
pub type LinkWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A reader/writer pair connecting an inbound to an outbound
pub struct Link {
    pub reader: LinkReader,
    pub writer: LinkWriter,
}

impl Link {
    pub fn new(reader: LinkReader, writer: LinkWriter) -> Self {
        Self { reader, writer }
    }

    /// Two cross-connected links: what one writes the other reads.
    ///
    /// `capacity` bounds the bytes buffered in each direction.
    pub fn pipe(capacity: usize) -> (Link, Link) {
        let (a, b) = tokio::io::duplex(capacity.max(1));
        let (a_reader, a_writer) = tokio::io::split(a);
        let (b_reader, b_writer) = tokio::io::split(b);
        (
            Link::new(Box::new(a_reader), Box::new(a_writer)),
            Link::new(Box::new(b_reader), Box::new(b_writer)),
        )
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}

/// A user known to a proxy handler
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoryUser {
    /// Unique key for add/remove and per-user stats
    pub email: String,
    pub level: u32,
}

impl MemoryUser {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            level: 0,
        }
    }
}

/// Handler for incoming connections
#[async_trait]
pub trait Inbound: Send + Sync {
    /// Networks this inbound accepts; the server rejects anything else before `process`
    fn networks(&self) -> &[Network];

    /// Serve one accepted connection until both directions finish or fail
    async fn process(
        &self,
        session: &Session,
        network: Network,
        conn: Arc<dyn Connection>,
        dispatcher: &dyn Dispatcher,
    ) -> Result<()>;

    fn user_manager(&self) -> Option<&dyn UserManager> {
        None
    }
}

/// Handler for outgoing connections
#[async_trait]
pub trait Outbound: Send + Sync {
    /// Carry `link` to the session's destination until both directions finish or fail
    async fn process(&self, session: &Session, link: Link, dialer: &dyn Dialer) -> Result<()>;

    fn user_manager(&self) -> Option<&dyn UserManager> {
        None
    }
}

/// Live user management on a handler
#[async_trait]
pub trait UserManager: Send + Sync {
    async fn add_user(&self, user: MemoryUser) -> std::result::Result<(), UserError>;

    /// Remove by email. An unknown email yields [`UserError::NotFound`].
    async fn remove_user(&self, email: &str) -> std::result::Result<(), UserError>;
}

/// Holder of an inbound handler
pub trait GetInbound {
    fn inbound(&self) -> &dyn Inbound;
}

/// Holder of an outbound handler
pub trait GetOutbound {
    fn outbound(&self) -> &dyn Outbound;
}
