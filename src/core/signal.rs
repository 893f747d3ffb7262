//! Activity signal and idle watchdog

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Receives a notification each time bytes move across a relay
pub trait ActivityUpdater: Send + Sync {
    fn update(&self);
}

/// Idle timer shared by both directions of a connection pair
///
/// Every [`update`](ActivityUpdater::update) pushes expiry out by the current
/// timeout; [`expired`](Self::expired) resolves once nothing has happened for
/// that long. The timeout can be shortened once one direction finishes.
#[derive(Debug)]
pub struct ActivityTimer {
    start: Instant,
    /// Milliseconds since `start` of the most recent activity
    last_activity: AtomicU64,
    updates: AtomicU64,
    timeout_ms: AtomicU64,
    changed: Notify,
}

impl ActivityTimer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            start: Instant::now(),
            last_activity: AtomicU64::new(0),
            updates: AtomicU64::new(0),
            timeout_ms: AtomicU64::new(duration_ms(timeout)),
            changed: Notify::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    /// Replace the idle timeout and count the change as activity.
    /// A zero timeout expires immediately.
    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout_ms.store(duration_ms(timeout), Ordering::Relaxed);
        self.touch();
        self.changed.notify_waiters();
    }

    pub fn last_activity(&self) -> Instant {
        self.start + Duration::from_millis(self.last_activity.load(Ordering::Relaxed))
    }

    /// Number of activity updates received from relays
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    pub fn idle(&self) -> Duration {
        self.last_activity().elapsed()
    }

    /// Resolve with the idle duration once the timeout elapses without activity
    pub async fn expired(&self) -> Duration {
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let timeout = self.timeout();
            let idle = self.idle();
            if timeout.is_zero() || idle >= timeout {
                return idle;
            }

            tokio::select! {
                _ = tokio::time::sleep(timeout - idle) => {}
                _ = &mut changed => {}
            }
        }
    }

    fn touch(&self) {
        let now = duration_ms(self.start.elapsed());
        self.last_activity.fetch_max(now, Ordering::Relaxed);
    }
}

impl ActivityUpdater for ActivityTimer {
    fn update(&self) {
        self.touch();
        self.updates.fetch_add(1, Ordering::Relaxed);
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
