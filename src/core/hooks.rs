//! Hook traits for extensibility
//!
//! Defines the collaborators the core consumes without owning: traffic
//! counters, the dispatcher that turns an inbound session into a [`Link`],
//! and the dialer outbounds use to reach a destination.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::conn::Connection;
use super::net::Destination;
use super::proxy::Link;
use super::session::Session;
use crate::error::Result;

/// Monotonic byte counter shared between a connection and the stats registry
pub trait Counter: Send + Sync + fmt::Debug {
    /// Add `delta` and return the new total
    fn add(&self, delta: u64) -> u64;

    fn value(&self) -> u64;
}

/// Lock-free [`Counter`] backed by an `AtomicU64`
#[derive(Debug, Default)]
pub struct AtomicCounter {
    value: AtomicU64,
}

impl AtomicCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset to zero, returning the value held before the reset
    pub fn reset(&self) -> u64 {
        self.value.swap(0, Ordering::Relaxed)
    }
}

impl Counter for AtomicCounter {
    fn add(&self, delta: u64) -> u64 {
        self.value.fetch_add(delta, Ordering::Relaxed) + delta
    }

    fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Uplink/downlink counter pair for one stats scope (inbound, outbound or user)
#[derive(Debug, Clone)]
pub struct TrafficCounters {
    /// Bytes sent by the client towards the destination
    pub uplink: Arc<dyn Counter>,
    /// Bytes returned from the destination to the client
    pub downlink: Arc<dyn Counter>,
}

/// Routes an accepted session to an outbound and hands back the inbound half of the link
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, session: &Session, destination: Destination) -> Result<Link>;
}

/// Opens outward connections for outbounds
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(
        &self,
        session: &Session,
        destination: &Destination,
    ) -> io::Result<Arc<dyn Connection>>;
}
