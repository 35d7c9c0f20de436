//! Per-broker metrics
//!
//! Atomic counters for connections, provisioning, publishing and subscriber
//! sessions, plus a bounded window of publish-confirm latencies. Every
//! [`crate::Broker`] owns its own collector so independent brokers in one
//! process never share counts.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const MAX_LATENCY_SAMPLES: usize = 1000;

/// Thread-safe metrics collector using atomics and a mutex-protected window
#[derive(Debug)]
pub struct BrokerMetrics {
    // Connections
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    connections_closed: AtomicU64,

    // Topology
    objects_asserted: AtomicU64,
    objects_checked: AtomicU64,
    objects_deleted: AtomicU64,
    queues_purged: AtomicU64,
    provisioning_failures: AtomicU64,

    // Publishing
    messages_published: AtomicU64,
    messages_unroutable: AtomicU64,
    publish_failures: AtomicU64,
    publish_latencies: Mutex<Vec<u64>>, // in microseconds

    // Sessions
    messages_delivered: AtomicU64,
    sessions_opened: AtomicU64,
    sessions_cancelled: AtomicU64,

    created_at: u64,
}

impl BrokerMetrics {
    pub fn new() -> Self {
        Self {
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            objects_asserted: AtomicU64::new(0),
            objects_checked: AtomicU64::new(0),
            objects_deleted: AtomicU64::new(0),
            queues_purged: AtomicU64::new(0),
            provisioning_failures: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            messages_unroutable: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            publish_latencies: Mutex::new(Vec::new()),
            messages_delivered: AtomicU64::new(0),
            sessions_opened: AtomicU64::new(0),
            sessions_cancelled: AtomicU64::new(0),
            created_at: current_timestamp(),
        }
    }

    // Connection metrics
    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    // Topology metrics
    pub fn object_asserted(&self) {
        self.objects_asserted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn object_checked(&self) {
        self.objects_checked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn object_deleted(&self) {
        self.objects_deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queue_purged(&self) {
        self.queues_purged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn provisioning_failed(&self) {
        self.provisioning_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Publish metrics
    pub fn message_published(&self, latency: Duration, routed: bool) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
        if !routed {
            self.messages_unroutable.fetch_add(1, Ordering::Relaxed);
        }
        if let Ok(mut latencies) = self.publish_latencies.lock() {
            latencies.push(latency.as_micros() as u64);
            if latencies.len() > MAX_LATENCY_SAMPLES {
                latencies.remove(0);
            }
        }
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Session metrics
    pub fn message_delivered(&self) {
        self.messages_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_cancelled(&self) {
        self.sessions_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    fn latency_statistics(&self) -> (f64, f64, f64) {
        let Ok(latencies) = self.publish_latencies.lock() else {
            return (0.0, 0.0, 0.0);
        };
        if latencies.is_empty() {
            return (0.0, 0.0, 0.0);
        }

        let mut sorted = latencies.clone();
        sorted.sort_unstable();
        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (avg, percentile(&sorted, 50.0), percentile(&sorted, 99.0))
    }

    /// Get complete metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg, p50, p99) = self.latency_statistics();
        let opened = self.sessions_opened.load(Ordering::Relaxed);
        let cancelled = self.sessions_cancelled.load(Ordering::Relaxed);

        MetricsSnapshot {
            connections: ConnectionMetrics {
                attempts: self.connection_attempts.load(Ordering::Relaxed),
                established: self.connections_established.load(Ordering::Relaxed),
                failures: self.connection_failures.load(Ordering::Relaxed),
                closed: self.connections_closed.load(Ordering::Relaxed),
            },
            topology: TopologyMetrics {
                asserted: self.objects_asserted.load(Ordering::Relaxed),
                checked: self.objects_checked.load(Ordering::Relaxed),
                deleted: self.objects_deleted.load(Ordering::Relaxed),
                purged: self.queues_purged.load(Ordering::Relaxed),
                failures: self.provisioning_failures.load(Ordering::Relaxed),
            },
            publishing: PublishMetrics {
                published: self.messages_published.load(Ordering::Relaxed),
                unroutable: self.messages_unroutable.load(Ordering::Relaxed),
                failures: self.publish_failures.load(Ordering::Relaxed),
                avg_confirm_latency_us: avg,
                confirm_latency_p50_us: p50,
                confirm_latency_p99_us: p99,
            },
            sessions: SessionMetrics {
                opened,
                cancelled,
                active: opened.saturating_sub(cancelled),
                delivered: self.messages_delivered.load(Ordering::Relaxed),
            },
            uptime_seconds: now.saturating_sub(self.created_at),
            timestamp: now,
        }
    }
}

impl Default for BrokerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub connections: ConnectionMetrics,
    pub topology: TopologyMetrics,
    pub publishing: PublishMetrics,
    pub sessions: SessionMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    pub attempts: u64,
    pub established: u64,
    pub failures: u64,
    pub closed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopologyMetrics {
    pub asserted: u64,
    pub checked: u64,
    pub deleted: u64,
    pub purged: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishMetrics {
    pub published: u64,
    pub unroutable: u64,
    pub failures: u64,
    pub avg_confirm_latency_us: f64,
    pub confirm_latency_p50_us: f64,
    pub confirm_latency_p99_us: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionMetrics {
    pub opened: u64,
    pub cancelled: u64,
    pub active: u64,
    pub delivered: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let index = (percentile / 100.0) * (sorted_data.len() - 1) as f64;
    let lower = sorted_data[index.floor() as usize] as f64;
    let upper = sorted_data[index.ceil() as usize] as f64;
    lower + (upper - lower) * index.fract()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_connection_metrics() {
        let metrics = BrokerMetrics::new();

        metrics.connection_attempt();
        metrics.connection_failed();
        metrics.connection_attempt();
        metrics.connection_established();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections.attempts, 2);
        assert_eq!(snapshot.connections.failures, 1);
        assert_eq!(snapshot.connections.established, 1);
    }

    #[test]
    fn test_publish_metrics() {
        let metrics = BrokerMetrics::new();

        metrics.message_published(Duration::from_micros(100), true);
        metrics.message_published(Duration::from_micros(300), false);
        metrics.publish_failed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.publishing.published, 2);
        assert_eq!(snapshot.publishing.unroutable, 1);
        assert_eq!(snapshot.publishing.failures, 1);
        assert!((snapshot.publishing.avg_confirm_latency_us - 200.0).abs() < 0.1);
    }

    #[test]
    fn test_active_sessions() {
        let metrics = BrokerMetrics::new();
        metrics.session_opened();
        metrics.session_opened();
        metrics.session_cancelled();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sessions.active, 1);
    }

    #[test]
    fn test_thread_safety() {
        let metrics = Arc::new(BrokerMetrics::new());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                thread::spawn(move || {
                    for _ in 0..100 {
                        metrics.message_delivered();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(metrics.snapshot().sessions.delivered, 1000);
    }

    #[test]
    fn test_percentile_calculation() {
        let data = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10];

        assert!((percentile(&data, 50.0) - 5.5).abs() < 0.1);
        assert!((percentile(&data, 0.0) - 1.0).abs() < 0.1);
        assert!((percentile(&data, 100.0) - 10.0).abs() < 0.1);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_latency_window_is_bounded() {
        let metrics = BrokerMetrics::new();
        for i in 0..1500 {
            metrics.message_published(Duration::from_micros(i), true);
        }
        assert_eq!(
            metrics.publish_latencies.lock().unwrap().len(),
            MAX_LATENCY_SAMPLES
        );
    }
}
