//! Session context and session management
//!
//! A [`Session`] travels with one accepted connection through inbound,
//! dispatcher and outbound. The [`SessionManager`] tracks live sessions and
//! can cancel all sessions of a user.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use super::conn::Connection;
use super::net::Destination;
use super::signal::ActivityTimer;

/// Unique session identifier
pub type SessionId = u64;

/// Per-connection context
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    inbound_tag: Arc<str>,
    source: Option<SocketAddr>,
    user: Option<Arc<str>>,
    destination: Option<Destination>,
    inbound_conn: Option<Arc<dyn Connection>>,
    can_splice: bool,
    activity: Option<Arc<ActivityTimer>>,
    cancel_token: CancellationToken,
    registry: Option<SessionManager>,
}

impl Session {
    /// A session not tracked by any manager
    pub fn new(id: SessionId, inbound_tag: &str) -> Self {
        Self {
            id,
            inbound_tag: Arc::from(inbound_tag),
            source: None,
            user: None,
            destination: None,
            inbound_conn: None,
            can_splice: false,
            activity: None,
            cancel_token: CancellationToken::new(),
            registry: None,
        }
    }

    pub fn with_source(mut self, source: SocketAddr) -> Self {
        self.source = Some(source);
        self
    }

    /// Bind the session to an authenticated user so it can be kicked by email
    pub fn with_user(mut self, email: &str) -> Self {
        if let Some(registry) = &self.registry {
            registry.attach_user(self.id, email);
        }
        self.user = Some(Arc::from(email));
        self
    }

    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Record the client-facing connection; outbounds may write responses to it
    /// directly when `can_splice` is set.
    pub fn with_inbound_conn(mut self, conn: Arc<dyn Connection>, can_splice: bool) -> Self {
        self.inbound_conn = Some(conn);
        self.can_splice = can_splice;
        self
    }

    /// Keep responses on the link instead of the inbound connection
    pub fn without_splice(mut self) -> Self {
        self.can_splice = false;
        self
    }

    /// Share the inbound's idle timer so an outbound writing straight to the
    /// inbound connection keeps it alive
    pub fn with_activity(mut self, timer: Arc<ActivityTimer>) -> Self {
        self.activity = Some(timer);
        self
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn inbound_tag(&self) -> &str {
        &self.inbound_tag
    }

    pub fn source(&self) -> Option<SocketAddr> {
        self.source
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn destination(&self) -> Option<&Destination> {
        self.destination.as_ref()
    }

    pub fn inbound_conn(&self) -> Option<&Arc<dyn Connection>> {
        self.inbound_conn.as_ref()
    }

    pub fn can_splice(&self) -> bool {
        self.can_splice
    }

    pub fn activity(&self) -> Option<&Arc<ActivityTimer>> {
        self.activity.as_ref()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel_token.cancelled().await
    }
}

#[derive(Debug, Clone)]
struct SessionInfo {
    user: Option<String>,
    #[allow(dead_code)]
    source: Option<SocketAddr>,
    #[allow(dead_code)]
    started_at: Instant,
}

#[derive(Debug)]
struct ActiveSession {
    info: SessionInfo,
    cancel_token: CancellationToken,
}

/// Manager for live sessions with kick-off capability
#[derive(Debug, Clone)]
pub struct SessionManager {
    next_id: Arc<AtomicU64>,
    sessions: Arc<DashMap<SessionId, ActiveSession>>,
    /// Map from user email to their session ids
    user_sessions: Arc<DashMap<String, Vec<SessionId>>>,
    /// Cancelled on shutdown; every session token is a child of it
    root: CancellationToken,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self::with_parent(CancellationToken::new())
    }

    /// Sessions are cancelled together with `parent`
    pub fn with_parent(parent: CancellationToken) -> Self {
        Self {
            next_id: Arc::new(AtomicU64::new(1)),
            sessions: Arc::new(DashMap::new()),
            user_sessions: Arc::new(DashMap::new()),
            root: parent,
        }
    }

    /// Register a new session for a connection accepted by `inbound_tag`
    pub fn register(&self, inbound_tag: &str, source: Option<SocketAddr>) -> Session {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel_token = self.root.child_token();

        self.sessions.insert(
            id,
            ActiveSession {
                info: SessionInfo {
                    user: None,
                    source,
                    started_at: Instant::now(),
                },
                cancel_token: cancel_token.clone(),
            },
        );

        Session {
            id,
            inbound_tag: Arc::from(inbound_tag),
            source,
            user: None,
            destination: None,
            inbound_conn: None,
            can_splice: false,
            activity: None,
            cancel_token,
            registry: Some(self.clone()),
        }
    }

    /// Index a live session under `email`. Returns false if the session is gone.
    pub fn attach_user(&self, id: SessionId, email: &str) -> bool {
        let Some(mut session) = self.sessions.get_mut(&id) else {
            return false;
        };
        if session.info.user.as_deref() == Some(email) {
            return true;
        }
        if let Some(previous) = session.info.user.replace(email.to_string()) {
            self.detach(&previous, id);
        }
        // Holding the session entry keeps a concurrent unregister from
        // slipping in between the two maps.
        self.user_sessions
            .entry(email.to_string())
            .or_default()
            .push(id);
        true
    }

    pub fn unregister(&self, id: SessionId) {
        if let Some((_, session)) = self.sessions.remove(&id) {
            if let Some(user) = session.info.user {
                self.detach(&user, id);
            }
        }
    }

    fn detach(&self, email: &str, id: SessionId) {
        // remove_if_mut holds the shard lock for the whole check, so a
        // concurrent attach cannot push into the Vec between retain and remove.
        self.user_sessions.remove_if_mut(email, |_, ids| {
            ids.retain(|&other| other != id);
            ids.is_empty()
        });
    }

    /// Cancel every session of a user, returning how many were cancelled
    pub fn kick_user(&self, email: &str) -> usize {
        let ids = match self.user_sessions.get(email) {
            Some(ids) => ids.clone(),
            None => return 0,
        };
        let mut kicked = 0;
        for id in ids {
            if let Some(session) = self.sessions.get(&id) {
                session.cancel_token.cancel();
                kicked += 1;
            }
        }
        kicked
    }

    /// Cancel every live session
    pub fn cancel_all(&self) {
        self.root.cancel();
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of users with live sessions
    pub fn user_count(&self) -> usize {
        self.user_sessions.len()
    }
}
