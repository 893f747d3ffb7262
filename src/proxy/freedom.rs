//! Direct outbound

use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

use super::{drive, Timeouts};
use crate::core::conn::{ConnIo, Connection};
use crate::core::hooks::Dialer;
use crate::core::proxy::{Link, Outbound};
use crate::core::relay::{Relay, Sink, Source};
use crate::core::session::Session;
use crate::core::signal::{ActivityTimer, ActivityUpdater};
use crate::error::{ProxyError, Result};
use crate::logger::log;

/// Dials the session destination and relays the link to it
pub struct Freedom {
    relay: Arc<Relay>,
    timeouts: Timeouts,
}

impl Freedom {
    pub fn new(relay: Arc<Relay>, timeouts: Timeouts) -> Self {
        Self { relay, timeouts }
    }

    /// The client connection to write responses to directly, if the session
    /// allows it and the relay can splice into it
    fn direct_sink<'a>(&self, session: &'a Session, remote: &dyn Connection) -> Option<&'a Arc<dyn Connection>> {
        if !session.can_splice() {
            return None;
        }
        session
            .inbound_conn()
            .filter(|inbound| self.relay.can_splice(remote, Arc::as_ref(inbound)))
    }
}

/// Forwards activity to this outbound's timer and to the inbound's, so a
/// response spliced past the link keeps both sides alive
struct SharedActivity<'a> {
    own: &'a ActivityTimer,
    inbound: Option<&'a ActivityTimer>,
}

impl ActivityUpdater for SharedActivity<'_> {
    fn update(&self) {
        self.own.update();
        if let Some(inbound) = self.inbound {
            inbound.update();
        }
    }
}

#[async_trait]
impl Outbound for Freedom {
    async fn process(&self, session: &Session, link: Link, dialer: &dyn Dialer) -> Result<()> {
        let destination = session
            .destination()
            .cloned()
            .ok_or_else(|| ProxyError::Other("target not specified".to_string()))?;

        let conn = dialer
            .dial(session, &destination)
            .await
            .map_err(|source| ProxyError::Dial {
                destination: destination.to_string(),
                source,
            })?;
        log::debug!(session = session.id(), destination = %destination, "Connection opened");

        let Link {
            mut reader,
            mut writer,
        } = link;
        let timer = ActivityTimer::new(self.timeouts.idle);
        let response_activity = SharedActivity {
            own: &timer,
            inbound: session.activity().map(Arc::as_ref),
        };

        let request = async {
            self.relay
                .transfer(session, Source::Stream(&mut *reader), Sink::Conn(conn.as_ref()), &timer)
                .await?;
            ConnIo::new(conn.as_ref()).shutdown().await?;
            timer.set_timeout(self.timeouts.downlink_only);
            Ok::<(), ProxyError>(())
        };

        let response = async {
            match self.direct_sink(session, conn.as_ref()) {
                Some(inbound) => {
                    log::debug!(session = session.id(), "Writing response to client connection");
                    let sink = Sink::Conn(inbound.as_ref());
                    self.relay
                        .transfer(session, Source::Conn(conn.as_ref()), sink, &response_activity)
                        .await?;
                }
                None => {
                    let sink = Sink::Stream(&mut *writer);
                    self.relay
                        .transfer(session, Source::Conn(conn.as_ref()), sink, &response_activity)
                        .await?;
                }
            }
            // The inbound may already be gone; its half of the link is done either way
            let _ = writer.shutdown().await;
            timer.set_timeout(self.timeouts.uplink_only);
            Ok::<(), ProxyError>(())
        };

        let result = drive(session, &timer, &[conn.as_ref()], request, response).await;
        conn.close();
        result
    }
}
