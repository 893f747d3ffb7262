//! Fixed-destination inbound

use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

use super::{drive, Timeouts};
use crate::business::UserStore;
use crate::core::conn::{ConnIo, Connection};
use crate::core::hooks::Dispatcher;
use crate::core::net::{Destination, Network};
use crate::core::proxy::{Inbound, Link, UserManager};
use crate::core::relay::{Relay, Sink, Source};
use crate::core::session::Session;
use crate::core::signal::ActivityTimer;
use crate::core::unwrap::is_secured;
use crate::error::{ProxyError, Result};
use crate::logger::log;

/// Forwards every accepted TCP connection to one destination
pub struct Tunnel {
    destination: Destination,
    relay: Arc<Relay>,
    timeouts: Timeouts,
    owner: Option<Owner>,
}

/// The user every tunneled session is accounted to
struct Owner {
    email: String,
    users: UserStore,
}

impl Tunnel {
    pub fn new(destination: Destination, relay: Arc<Relay>, timeouts: Timeouts) -> Self {
        Self {
            destination,
            relay,
            timeouts,
            owner: None,
        }
    }

    /// Attribute every session to `email`. Connections are refused while
    /// `users` does not hold that email, and removing it kicks live sessions.
    pub fn with_owner(mut self, email: impl Into<String>, users: UserStore) -> Self {
        self.owner = Some(Owner {
            email: email.into(),
            users,
        });
        self
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }
}

#[async_trait]
impl Inbound for Tunnel {
    fn networks(&self) -> &[Network] {
        &[Network::Tcp]
    }

    fn user_manager(&self) -> Option<&dyn UserManager> {
        self.owner.as_ref().map(|owner| &owner.users as &dyn UserManager)
    }

    async fn process(
        &self,
        session: &Session,
        _network: Network,
        conn: Arc<dyn Connection>,
        dispatcher: &dyn Dispatcher,
    ) -> Result<()> {
        let mut session = session.clone();
        if let Some(owner) = &self.owner {
            if !owner.users.contains(&owner.email).await {
                conn.close();
                return Err(ProxyError::Other(format!("user {} is not enabled", owner.email)));
            }
            session = session.with_user(&owner.email);
        }

        let timer = Arc::new(ActivityTimer::new(self.timeouts.idle));
        // Outbounds may only write to the client socket when nothing sits
        // between it and the kernel that the relay could bypass
        let session = session
            .with_destination(self.destination.clone())
            .with_inbound_conn(Arc::clone(&conn), !is_secured(conn.as_ref()))
            .with_activity(Arc::clone(&timer));
        log::debug!(session = session.id(), destination = %self.destination, "Tunneling");

        let Link {
            mut reader,
            mut writer,
        } = match dispatcher.dispatch(&session, self.destination.clone()).await {
            Ok(link) => link,
            Err(e) => {
                conn.close();
                return Err(e);
            }
        };

        let request = async {
            self.relay
                .transfer(&session, Source::Conn(conn.as_ref()), Sink::Stream(&mut *writer), timer.as_ref())
                .await?;
            writer.shutdown().await?;
            timer.set_timeout(self.timeouts.downlink_only);
            Ok::<(), ProxyError>(())
        };

        let response = async {
            self.relay
                .transfer(&session, Source::Stream(&mut *reader), Sink::Conn(conn.as_ref()), timer.as_ref())
                .await?;
            ConnIo::new(conn.as_ref()).shutdown().await?;
            timer.set_timeout(self.timeouts.uplink_only);
            Ok::<(), ProxyError>(())
        };

        let result = drive(&session, &timer, &[conn.as_ref()], request, response).await;
        conn.close();
        result
    }
}
