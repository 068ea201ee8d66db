//! Thread-safe metrics collection system
//!
//! Atomic counters for the MQTT session, telemetry delivery and RPC handling,
//! plus a bounded window of RPC latencies for percentile reporting.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Latencies kept for percentile calculation
const LATENCY_WINDOW: usize = 1000;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // MQTT session
    mqtt_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    connections_lost: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    messages_received: AtomicU64,
    messages_dropped: AtomicU64,
    connection_start_time: AtomicU64,

    // Telemetry
    telemetry_submitted: AtomicU64,
    telemetry_rejected: AtomicU64,
    telemetry_acknowledged: AtomicU64,
    telemetry_failed: AtomicU64,

    // RPC
    rpc_received: AtomicU64,
    rpc_dropped: AtomicU64,
    rpc_succeeded: AtomicU64,
    rpc_failed: AtomicU64,
    rpc_latencies: Mutex<Vec<u64>>, // milliseconds

    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            mqtt_connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            connections_lost: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            telemetry_submitted: AtomicU64::new(0),
            telemetry_rejected: AtomicU64::new(0),
            telemetry_acknowledged: AtomicU64::new(0),
            telemetry_failed: AtomicU64::new(0),
            rpc_received: AtomicU64::new(0),
            rpc_dropped: AtomicU64::new(0),
            rpc_succeeded: AtomicU64::new(0),
            rpc_failed: AtomicU64::new(0),
            rpc_latencies: Mutex::new(Vec::new()),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // MQTT metrics
    pub fn mqtt_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn mqtt_connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn mqtt_connection_lost(&self) {
        self.connections_lost.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn mqtt_message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    // Telemetry metrics
    pub fn telemetry_submitted(&self) {
        self.telemetry_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn telemetry_rejected(&self) {
        self.telemetry_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn telemetry_acknowledged(&self) {
        self.telemetry_acknowledged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn telemetry_failed(&self) {
        self.telemetry_failed.fetch_add(1, Ordering::Relaxed);
    }

    // RPC metrics
    pub fn rpc_received(&self) {
        self.rpc_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rpc_dropped(&self) {
        self.rpc_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rpc_succeeded(&self, duration: Duration) {
        self.rpc_succeeded.fetch_add(1, Ordering::Relaxed);
        self.record_rpc_latency(duration);
    }

    pub fn rpc_failed(&self, duration: Duration) {
        self.rpc_failed.fetch_add(1, Ordering::Relaxed);
        self.record_rpc_latency(duration);
    }

    fn record_rpc_latency(&self, duration: Duration) {
        if let Ok(mut latencies) = self.rpc_latencies.lock() {
            latencies.push(duration.as_millis() as u64);
            if latencies.len() > LATENCY_WINDOW {
                latencies.remove(0);
            }
        }
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        let counters = [
            &self.connection_attempts,
            &self.connections_established,
            &self.connection_failures,
            &self.connections_lost,
            &self.messages_published,
            &self.publish_failures,
            &self.messages_received,
            &self.messages_dropped,
            &self.connection_start_time,
            &self.telemetry_submitted,
            &self.telemetry_rejected,
            &self.telemetry_acknowledged,
            &self.telemetry_failed,
            &self.rpc_received,
            &self.rpc_dropped,
            &self.rpc_succeeded,
            &self.rpc_failed,
        ];
        for counter in counters {
            counter.store(0, Ordering::Relaxed);
        }
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
        if let Ok(mut latencies) = self.rpc_latencies.lock() {
            latencies.clear();
        }
    }

    /// Average and p50/p95/p99 of the latency window
    fn latency_statistics(&self) -> (f64, f64, f64, f64) {
        let Ok(latencies) = self.rpc_latencies.lock() else {
            return (0.0, 0.0, 0.0, 0.0);
        };
        if latencies.is_empty() {
            return (0.0, 0.0, 0.0, 0.0);
        }

        let mut sorted = latencies.clone();
        sorted.sort_unstable();
        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (
            avg,
            percentile(&sorted, 50.0),
            percentile(&sorted, 95.0),
            percentile(&sorted, 99.0),
        )
    }

    fn connection_duration(&self, now: u64) -> u64 {
        if !self.mqtt_connected.load(Ordering::Relaxed) {
            return 0;
        }
        let start = self.connection_start_time.load(Ordering::Relaxed);
        if start > 0 {
            now.saturating_sub(start)
        } else {
            0
        }
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg_latency_ms, p50, p95, p99) = self.latency_statistics();

        MetricsSnapshot {
            mqtt: MqttMetrics {
                connected: self.mqtt_connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                connections_lost: self.connections_lost.load(Ordering::Relaxed),
                messages_published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                messages_received: self.messages_received.load(Ordering::Relaxed),
                messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
                connection_duration_seconds: self.connection_duration(now),
            },
            telemetry: TelemetryMetrics {
                submitted: self.telemetry_submitted.load(Ordering::Relaxed),
                rejected: self.telemetry_rejected.load(Ordering::Relaxed),
                acknowledged: self.telemetry_acknowledged.load(Ordering::Relaxed),
                failed: self.telemetry_failed.load(Ordering::Relaxed),
            },
            rpc: RpcMetrics {
                received: self.rpc_received.load(Ordering::Relaxed),
                dropped: self.rpc_dropped.load(Ordering::Relaxed),
                succeeded: self.rpc_succeeded.load(Ordering::Relaxed),
                failed: self.rpc_failed.load(Ordering::Relaxed),
                avg_latency_ms,
                latency_p50_ms: p50,
                latency_p95_ms: p95,
                latency_p99_ms: p99,
            },
            uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub mqtt: MqttMetrics,
    pub telemetry: TelemetryMetrics,
    pub rpc: RpcMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MqttMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub connections_lost: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TelemetryMetrics {
    pub submitted: u64,
    pub rejected: u64,
    pub acknowledged: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcMetrics {
    pub received: u64,
    pub dropped: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub avg_latency_ms: f64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
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
    fn test_mqtt_metrics() {
        let collector = MetricsCollector::new();

        collector.mqtt_connection_attempt();
        collector.mqtt_connection_established();
        collector.mqtt_message_published();

        let snapshot = collector.get_metrics();
        assert_eq!(snapshot.mqtt.connection_attempts, 1);
        assert_eq!(snapshot.mqtt.connections_established, 1);
        assert_eq!(snapshot.mqtt.messages_published, 1);
        assert!(snapshot.mqtt.connected);

        collector.mqtt_connection_lost();
        let snapshot = collector.get_metrics();
        assert!(!snapshot.mqtt.connected);
        assert_eq!(snapshot.mqtt.connections_lost, 1);
    }

    #[test]
    fn test_rpc_latency_statistics() {
        let collector = MetricsCollector::new();

        collector.rpc_received();
        collector.rpc_succeeded(Duration::from_millis(100));
        collector.rpc_received();
        collector.rpc_failed(Duration::from_millis(300));

        let snapshot = collector.get_metrics();
        assert_eq!(snapshot.rpc.received, 2);
        assert_eq!(snapshot.rpc.succeeded, 1);
        assert_eq!(snapshot.rpc.failed, 1);
        assert!((snapshot.rpc.avg_latency_ms - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_latency_window_is_bounded() {
        let collector = MetricsCollector::new();
        for i in 0..1500 {
            collector.rpc_succeeded(Duration::from_millis(i));
        }

        assert_eq!(collector.rpc_latencies.lock().unwrap().len(), LATENCY_WINDOW);
        // oldest 500 samples were evicted
        assert!(collector.get_metrics().rpc.latency_p50_ms > 900.0);
    }

    #[test]
    fn test_thread_safety() {
        let collector = Arc::new(MetricsCollector::new());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let collector = Arc::clone(&collector);
                thread::spawn(move || {
                    for _ in 0..100 {
                        collector.telemetry_submitted();
                        collector.mqtt_message_published();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = collector.get_metrics();
        assert_eq!(snapshot.telemetry.submitted, 1000);
        assert_eq!(snapshot.mqtt.messages_published, 1000);
    }

    #[test]
    fn test_percentile_calculation() {
        let data = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10];

        assert!((percentile(&data, 50.0) - 5.5).abs() < 0.1);
        assert!((percentile(&data, 95.0) - 9.55).abs() < 0.1);
        assert!((percentile(&data, 0.0) - 1.0).abs() < 0.1);
        assert!((percentile(&data, 100.0) - 10.0).abs() < 0.1);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_reset_functionality() {
        let collector = MetricsCollector::new();

        collector.telemetry_submitted();
        collector.mqtt_connection_established();
        collector.rpc_succeeded(Duration::from_millis(5));

        collector.reset();

        let snapshot = collector.get_metrics();
        assert_eq!(snapshot.telemetry.submitted, 0);
        assert_eq!(snapshot.rpc.succeeded, 0);
        assert_eq!(snapshot.rpc.avg_latency_ms, 0.0);
        assert!(!snapshot.mqtt.connected);
    }
}
