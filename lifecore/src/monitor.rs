//! Operation statistics and leak detection
//!
//! [`LifecycleStats`] counts acquire and release operations across every
//! state sharing it: how many are in flight, how many completed, how many
//! backend errors were seen and how long operations took.
//! [`ResourceLeakDetector`] tracks live states so long-lived ones can be
//! reported.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Shared operation counters.
#[derive(Debug, Default)]
pub struct LifecycleStats {
    in_flight: AtomicU64,
    completed: AtomicU64,
    errors: AtomicU64,
    total_latency_us: AtomicU64,
    max_latency_us: AtomicU64,
}

impl LifecycleStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one backend error.
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Read all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            operations_in_flight: self.in_flight.load(Ordering::Relaxed),
            operations_completed: self.completed.load(Ordering::Relaxed),
            total_errors: self.errors.load(Ordering::Relaxed),
            total_latency_us: self.total_latency_us.load(Ordering::Relaxed),
            max_latency_us: self.max_latency_us.load(Ordering::Relaxed),
        }
    }

    fn operation_started(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    fn operation_finished(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us.fetch_add(micros, Ordering::Relaxed);
        self.max_latency_us.fetch_max(micros, Ordering::Relaxed);
    }
}

/// Copy of the counters at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Operations admitted and not yet answered
    pub operations_in_flight: u64,
    /// Operations answered
    pub operations_completed: u64,
    /// Backend open/load failures
    pub total_errors: u64,
    /// Sum of all operation latencies in microseconds
    pub total_latency_us: u64,
    /// Largest single operation latency in microseconds
    pub max_latency_us: u64,
}

impl StatsSnapshot {
    /// Mean latency of completed operations.
    pub fn average_latency(&self) -> Option<Duration> {
        self.total_latency_us
            .checked_div(self.operations_completed)
            .map(Duration::from_micros)
    }

    /// Render as JSON for diagnostics endpoints or dumps.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Measures one acquire or release from admission until its reply.
///
/// Dropping the timer records the operation, so a reply dropped without
/// being sent is still accounted for.
#[derive(Debug)]
pub(crate) struct OperationTimer {
    stats: Arc<LifecycleStats>,
    started: Instant,
    slow_threshold: Duration,
    operation: &'static str,
    resource_type: &'static str,
    short_id: u32,
}

impl OperationTimer {
    pub(crate) fn start(
        stats: Arc<LifecycleStats>,
        slow_threshold: Duration,
        operation: &'static str,
        resource_type: &'static str,
        short_id: u32,
    ) -> Self {
        stats.operation_started();
        Self {
            stats,
            started: Instant::now(),
            slow_threshold,
            operation,
            resource_type,
            short_id,
        }
    }
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        let latency = self.started.elapsed();
        self.stats.operation_finished(latency);
        if latency > self.slow_threshold {
            warn!(
                resource_type = self.resource_type,
                short_id = self.short_id,
                operation = self.operation,
                latency_ms = latency.as_millis(),
                "Slow lifecycle operation"
            );
        }
    }
}

/// Leak detector for live resource states
#[derive(Debug, Default)]
pub struct ResourceLeakDetector {
    active_states: Mutex<HashMap<String, StateInfo>>,
}

#[derive(Debug, Clone)]
struct StateInfo {
    resource_type: String,
    created_at: Instant,
}

impl ResourceLeakDetector {
    /// Create a new leak detector
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a state creation
    pub fn register_creation(&self, state_id: &str, resource_type: &str) {
        self.active_states.lock().insert(
            state_id.to_string(),
            StateInfo {
                resource_type: resource_type.to_string(),
                created_at: Instant::now(),
            },
        );
    }

    /// Register a state destruction
    pub fn register_destruction(&self, state_id: &str) {
        self.active_states.lock().remove(state_id);
    }

    /// Get statistics about live states
    pub fn get_stats(&self) -> ResourceLeakStats {
        let states = self.active_states.lock();
        let mut by_type = HashMap::new();
        let mut oldest_age = Duration::ZERO;

        for info in states.values() {
            *by_type.entry(info.resource_type.clone()).or_insert(0) += 1;
            oldest_age = oldest_age.max(info.created_at.elapsed());
        }

        ResourceLeakStats {
            total_active: states.len(),
            by_type,
            oldest_state_age: oldest_age,
        }
    }

    /// Find states alive for longer than `threshold`
    pub fn find_potential_leaks(&self, threshold: Duration) -> Vec<String> {
        self.active_states
            .lock()
            .iter()
            .filter(|(_, info)| info.created_at.elapsed() > threshold)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Statistics about live states
#[derive(Debug, Default)]
pub struct ResourceLeakStats {
    /// Total number of live states
    pub total_active: usize,
    /// Count of live states by managing type
    pub by_type: HashMap<String, usize>,
    /// Age of the oldest live state
    pub oldest_state_age: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_records_on_drop() {
        let stats = Arc::new(LifecycleStats::new());
        let timer = OperationTimer::start(
            Arc::clone(&stats),
            Duration::from_secs(5),
            "acquire",
            "Test",
            1,
        );
        assert_eq!(stats.snapshot().operations_in_flight, 1);

        drop(timer);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.operations_in_flight, 0);
        assert_eq!(snapshot.operations_completed, 1);
        assert!(snapshot.average_latency().is_some());
    }

    #[test]
    fn test_average_latency_without_operations() {
        assert_eq!(StatsSnapshot::default().average_latency(), None);
    }

    #[test]
    fn test_snapshot_to_json() {
        let stats = LifecycleStats::new();
        stats.record_error();
        let json = stats.snapshot().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["total_errors"], 1);
    }

    #[tokio::test]
    async fn test_leak_detector() {
        let detector = ResourceLeakDetector::new();

        detector.register_creation("Bank:1", "Bank");
        detector.register_creation("Bank:2", "Bank");
        detector.register_creation("Media:7", "Media");

        let stats = detector.get_stats();
        assert_eq!(stats.total_active, 3);
        assert_eq!(stats.by_type.get("Bank"), Some(&2));

        tokio::time::sleep(Duration::from_millis(10)).await;
        let leaks = detector.find_potential_leaks(Duration::from_millis(5));
        assert_eq!(leaks.len(), 3);

        detector.register_destruction("Bank:1");
        assert_eq!(detector.get_stats().total_active, 2);
        assert!(detector
            .find_potential_leaks(Duration::from_secs(60))
            .is_empty());
    }
}
