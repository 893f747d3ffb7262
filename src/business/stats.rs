//! Named traffic counter registry

use dashmap::DashMap;
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;

use crate::core::hooks::{AtomicCounter, Counter, TrafficCounters};

/// Counter value at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub name: String,
    pub value: u64,
}

/// Registry of named counters, shared by every connection that reports traffic
///
/// Names follow `{scope}>>>{name}>>>traffic>>>{uplink|downlink}`.
#[derive(Debug, Default)]
pub struct StatsManager {
    counters: DashMap<String, Arc<AtomicCounter>>,
    /// Serializes resets so two reporters never split one interval
    reset_lock: Mutex<()>,
}

impl StatsManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the counter called `name`, creating it on first use
    pub fn register_counter(&self, name: &str) -> Arc<AtomicCounter> {
        if let Some(counter) = self.counters.get(name) {
            return Arc::clone(&counter);
        }
        Arc::clone(&self.counters.entry(name.to_string()).or_default())
    }

    pub fn get_counter(&self, name: &str) -> Option<Arc<AtomicCounter>> {
        self.counters.get(name).map(|c| Arc::clone(&c))
    }

    pub fn unregister_counter(&self, name: &str) -> bool {
        self.counters.remove(name).is_some()
    }

    /// Uplink/downlink pair for `scope` (inbound, outbound or user) and `name`
    pub fn traffic_counters(&self, scope: &str, name: &str) -> TrafficCounters {
        TrafficCounters {
            uplink: self.register_counter(&traffic_counter_name(scope, name, "uplink")),
            downlink: self.register_counter(&traffic_counter_name(scope, name, "downlink")),
        }
    }

    /// Current values of all counters, sorted by name
    pub fn snapshot(&self) -> Vec<CounterSnapshot> {
        let mut snapshots: Vec<CounterSnapshot> = self
            .counters
            .iter()
            .map(|entry| CounterSnapshot {
                name: entry.key().clone(),
                value: entry.value().value(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Swap every counter to zero and return the non-zero values taken.
    ///
    /// Adds racing with the reset land either in this snapshot or in the next.
    pub fn reset_all(&self) -> Vec<CounterSnapshot> {
        let _guard = self.reset_lock.lock().unwrap_or_else(PoisonError::into_inner);

        // Collect first to avoid holding shard locks during swaps
        let counters: Vec<(String, Arc<AtomicCounter>)> = self
            .counters
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut snapshots: Vec<CounterSnapshot> = counters
            .into_iter()
            .filter_map(|(name, counter)| {
                let value = counter.reset();
                (value > 0).then_some(CounterSnapshot { name, value })
            })
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }
}

/// Format bytes into human-readable string (KB, MB, GB)
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}KB", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

pub fn traffic_counter_name(scope: &str, name: &str, direction: &str) -> String {
    format!("{}>>>{}>>>traffic>>>{}", scope, name, direction)
}

pin_project! {
    /// Link writer that adds every byte written to a counter
    pub struct StatWriter<W> {
        #[pin]
        inner: W,
        counter: Arc<dyn Counter>,
    }
}

impl<W> StatWriter<W> {
    pub fn new(inner: W, counter: Arc<dyn Counter>) -> Self {
        Self { inner, counter }
    }
}

impl<W: AsyncWrite> AsyncWrite for StatWriter<W> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.project();
        let result = this.inner.poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            if *n > 0 {
                this.counter.add(*n as u64);
            }
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_register_counter_is_idempotent() {
        let stats = StatsManager::new();
        let a = stats.register_counter("inbound>>>in>>>traffic>>>uplink");
        let b = stats.register_counter("inbound>>>in>>>traffic>>>uplink");
        a.add(10);
        assert_eq!(b.value(), 10);
        assert_eq!(stats.counter_count(), 1);
    }

    #[test]
    fn test_traffic_counter_names() {
        let stats = StatsManager::new();
        let traffic = stats.traffic_counters("user", "a@example.com");
        traffic.uplink.add(3);
        traffic.downlink.add(4);

        let up = stats.get_counter("user>>>a@example.com>>>traffic>>>uplink").unwrap();
        let down = stats.get_counter("user>>>a@example.com>>>traffic>>>downlink").unwrap();
        assert_eq!(up.value(), 3);
        assert_eq!(down.value(), 4);
    }

    #[test]
    fn test_unregister_counter() {
        let stats = StatsManager::new();
        stats.register_counter("x");
        assert!(stats.unregister_counter("x"));
        assert!(!stats.unregister_counter("x"));
        assert!(stats.get_counter("x").is_none());
    }

    #[test]
    fn test_snapshot_sorted() {
        let stats = StatsManager::new();
        stats.register_counter("b").add(2);
        stats.register_counter("a").add(1);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot[0], CounterSnapshot { name: "a".to_string(), value: 1 });
        assert_eq!(snapshot[1], CounterSnapshot { name: "b".to_string(), value: 2 });
    }

    #[test]
    fn test_reset_all_returns_nonzero_and_zeroes() {
        let stats = StatsManager::new();
        stats.register_counter("busy").add(100);
        stats.register_counter("idle");

        let taken = stats.reset_all();
        assert_eq!(taken, vec![CounterSnapshot { name: "busy".to_string(), value: 100 }]);
        assert_eq!(stats.get_counter("busy").unwrap().value(), 0);
        assert!(stats.reset_all().is_empty());
    }

    #[test]
    fn test_concurrent_adds_and_resets_lose_nothing() {
        use std::thread;

        let stats = Arc::new(StatsManager::new());
        let counter = stats.register_counter("c");
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        counter.add(1);
                    }
                })
            })
            .collect();

        let mut total = 0;
        for _ in 0..50 {
            total += stats.reset_all().iter().map(|s| s.value).sum::<u64>();
        }
        for w in writers {
            w.join().unwrap();
        }
        total += stats.reset_all().iter().map(|s| s.value).sum::<u64>();
        assert_eq!(total, 40_000);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(2048), "2.00KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00GB");
    }

    #[tokio::test]
    async fn test_stat_writer_counts() {
        let counter = Arc::new(AtomicCounter::new());
        let mut writer = StatWriter::new(Vec::new(), counter.clone());
        writer.write_all(b"hello world").await.unwrap();
        writer.flush().await.unwrap();
        assert_eq!(counter.value(), 11);
    }
}
