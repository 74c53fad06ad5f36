//! Thread-safe metrics collection system
//!
//! Provides atomic counters for tracking operational statistics across the
//! broker connection, message dispatch and supervised workers.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics
pub struct MetricsCollector {
    // MQTT metrics
    mqtt_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    connections_lost: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    messages_received: AtomicU64,
    handler_failures: AtomicU64,
    connection_start_time: AtomicU64,

    // Worker metrics
    worker_starts: AtomicU64,
    worker_stops: AtomicU64,
    worker_failures: AtomicU64,
    worker_restarts: AtomicU64,
    drain_timeouts: AtomicU64,

    // Lifecycle metrics
    service_state: Mutex<String>,
    uptime_start: AtomicU64,
    state_transitions: AtomicU64,
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
            handler_failures: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            worker_starts: AtomicU64::new(0),
            worker_stops: AtomicU64::new(0),
            worker_failures: AtomicU64::new(0),
            worker_restarts: AtomicU64::new(0),
            drain_timeouts: AtomicU64::new(0),
            service_state: Mutex::new("initializing".to_string()),
            uptime_start: AtomicU64::new(current_timestamp()),
            state_transitions: AtomicU64::new(0),
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

    pub fn mqtt_disconnected(&self) {
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

    pub fn handler_failed(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Worker metrics
    pub fn worker_started(&self) {
        self.worker_starts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_stopped(&self) {
        self.worker_stops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_failed(&self) {
        self.worker_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_restarted(&self) {
        self.worker_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn drain_timeout(&self) {
        self.drain_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    // Lifecycle metrics
    pub fn set_service_state(&self, state: &str) {
        if let Ok(mut current) = self.service_state.lock() {
            if *current != state {
                *current = state.to_string();
                self.state_transitions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Reset all counters (for testing)
    pub fn reset(&self) {
        for counter in [
            &self.connection_attempts,
            &self.connections_established,
            &self.connection_failures,
            &self.connections_lost,
            &self.messages_published,
            &self.publish_failures,
            &self.messages_received,
            &self.handler_failures,
            &self.connection_start_time,
            &self.worker_starts,
            &self.worker_stops,
            &self.worker_failures,
            &self.worker_restarts,
            &self.drain_timeouts,
            &self.state_transitions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);

        if let Ok(mut state) = self.service_state.lock() {
            *state = "initializing".to_string();
        }
    }

    /// Calculate connection duration (pure function)
    fn calculate_connection_duration(&self, now: u64) -> u64 {
        if !self.mqtt_connected.load(Ordering::Relaxed) {
            return 0;
        }
        let start_time = self.connection_start_time.load(Ordering::Relaxed);
        if start_time > 0 {
            now.saturating_sub(start_time)
        } else {
            0
        }
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();

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
                handler_failures: self.handler_failures.load(Ordering::Relaxed),
                connection_duration_seconds: self.calculate_connection_duration(now),
            },
            workers: WorkerMetrics {
                starts: self.worker_starts.load(Ordering::Relaxed),
                stops: self.worker_stops.load(Ordering::Relaxed),
                failures: self.worker_failures.load(Ordering::Relaxed),
                restarts: self.worker_restarts.load(Ordering::Relaxed),
                drain_timeouts: self.drain_timeouts.load(Ordering::Relaxed),
            },
            lifecycle: LifecycleMetrics {
                current_state: self
                    .service_state
                    .lock()
                    .map(|s| s.clone())
                    .unwrap_or_else(|_| "unknown".to_string()),
                uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
                state_transitions: self.state_transitions.load(Ordering::Relaxed),
            },
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

// Public metrics structures
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub mqtt: MqttMetrics,
    pub workers: WorkerMetrics,
    pub lifecycle: LifecycleMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct MqttMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub connections_lost: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub messages_received: u64,
    pub handler_failures: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct WorkerMetrics {
    pub starts: u64,
    pub stops: u64,
    pub failures: u64,
    pub restarts: u64,
    pub drain_timeouts: u64,
}

#[derive(Debug, Serialize)]
pub struct LifecycleMetrics {
    pub current_state: String,
    pub uptime_seconds: u64,
    pub state_transitions: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
