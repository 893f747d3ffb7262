//! Default session dispatcher
//!
//! Pairs every dispatched session with one outbound through an in-memory
//! [`Link`] and runs the outbound on its own task.

use async_trait::async_trait;
use std::sync::Arc;

use super::stats::{StatWriter, StatsManager};
use crate::core::hooks::{Dialer, Dispatcher};
use crate::core::net::Destination;
use crate::core::proxy::{GetOutbound, Link, Outbound};
use crate::core::relay::DEFAULT_BUFFER_SIZE;
use crate::core::session::Session;
use crate::error::Result;
use crate::logger::log;

pub struct DefaultDispatcher {
    outbound: Arc<dyn Outbound>,
    dialer: Arc<dyn Dialer>,
    stats: Option<Arc<StatsManager>>,
    buffer_size: usize,
}

impl DefaultDispatcher {
    pub fn new(outbound: Arc<dyn Outbound>, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            outbound,
            dialer,
            stats: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Count per-user traffic on the link for sessions that carry a user
    pub fn with_stats(mut self, stats: Arc<StatsManager>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Bytes buffered in each direction of the link
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }
}

#[async_trait]
impl Dispatcher for DefaultDispatcher {
    async fn dispatch(&self, session: &Session, destination: Destination) -> Result<Link> {
        let mut session = session.clone().with_destination(destination);
        let (mut inbound_link, mut outbound_link) = Link::pipe(self.buffer_size);

        if let (Some(stats), Some(user)) = (&self.stats, session.user()) {
            let traffic = stats.traffic_counters("user", user);
            inbound_link.writer = Box::new(StatWriter::new(inbound_link.writer, traffic.uplink));
            outbound_link.writer = Box::new(StatWriter::new(outbound_link.writer, traffic.downlink));
            // User counters live on the link; a direct write would skip them
            session = session.without_splice();
        }

        let outbound = Arc::clone(&self.outbound);
        let dialer = Arc::clone(&self.dialer);
        tokio::spawn(async move {
            if let Err(e) = outbound.process(&session, outbound_link, dialer.as_ref()).await {
                log::debug!(session = session.id(), error = %e, "Outbound finished with error");
            }
        });

        Ok(inbound_link)
    }
}

impl GetOutbound for DefaultDispatcher {
    fn outbound(&self) -> &dyn Outbound {
        self.outbound.as_ref()
    }
}
