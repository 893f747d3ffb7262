//! Built-in proxy handlers
//!
//! - [`Tunnel`]: inbound that forwards every connection to a fixed destination
//! - [`Freedom`]: outbound that dials the session destination directly

mod freedom;
mod tunnel;

pub use freedom::Freedom;
pub use tunnel::Tunnel;

use std::future::Future;
use std::time::Duration;

use crate::config::ConnConfig;
use crate::core::conn::Connection;
use crate::core::session::Session;
use crate::core::signal::ActivityTimer;
use crate::error::{ProxyError, Result};

/// Idle policy for one proxied connection pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Inactivity allowed while both directions are open
    pub idle: Duration,
    /// Inactivity allowed once the downlink has finished
    pub uplink_only: Duration,
    /// Inactivity allowed once the uplink has finished
    pub downlink_only: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::from(&ConnConfig::default())
    }
}

impl From<&ConnConfig> for Timeouts {
    fn from(config: &ConnConfig) -> Self {
        Self {
            idle: config.idle_timeout,
            uplink_only: config.uplink_only,
            downlink_only: config.downlink_only,
        }
    }
}

/// Run both directions of a connection pair to completion.
///
/// Fails when either direction fails, when `timer` expires, or when the
/// session is cancelled; on failure every connection in `conns` is closed so
/// the other direction unblocks.
pub(crate) async fn drive<Req, Resp>(
    session: &Session,
    timer: &ActivityTimer,
    conns: &[&dyn Connection],
    request: Req,
    response: Resp,
) -> Result<()>
where
    Req: Future<Output = Result<()>>,
    Resp: Future<Output = Result<()>>,
{
    let result = tokio::select! {
        res = async { tokio::try_join!(request, response).map(|_| ()) } => res,
        idle = timer.expired() => Err(ProxyError::IdleTimeout(idle)),
        _ = session.cancelled() => Err(ProxyError::Cancelled),
    };

    if result.is_err() {
        for conn in conns {
            conn.close();
        }
    }
    result
}
